#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! `fluidics` command-line front end.

mod cli;
mod commands;
mod error_fmt;
mod logging;
mod rig;

use clap::Parser;
use cli::{Cli, JSON_MODE};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use eyre::WrapErr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    // Panic/backtrace hooks only; errors are rendered by `humanize` below.
    let _ = color_eyre::install();

    if let Err(err) = run(&cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn run(cli: &Cli) -> eyre::Result<()> {
    let cfg = fluidics_config::load_file(&cli.config)?;
    cfg.validate().wrap_err("invalid configuration")?;
    logging::init_tracing(cli.json, &cli.log_level, &cfg.logging)?;
    tracing::debug!(config = ?cli.config, "configuration loaded");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
            tracing::warn!(error = %e, "Ctrl-C handler not installed");
        }
    }

    commands::run(&cli.cmd, &cfg, cli.json, &interrupted)
}

//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "fluidics", version, about = "Fluidics rig control")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/fluidics.toml")]
    pub config: PathBuf,

    /// Print results and logs as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Valve branch as typed on the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BranchArg {
    A,
    B,
}

impl From<BranchArg> for fluidics_core::Branch {
    fn from(b: BranchArg) -> Self {
        match b {
            BranchArg::A => Self::A,
            BranchArg::B => Self::B,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the configured steps
    Steps,
    /// Run a step until its pumps finish (Ctrl-C releases it)
    Apply {
        /// Step label, as listed by `steps`
        label: String,
        /// Override the pulse count
        #[arg(long, value_name = "N")]
        pulses: Option<u32>,
        /// Override the pulse period in seconds
        #[arg(long, value_name = "SECS")]
        period: Option<f64>,
        /// Release the step after this many seconds if still pumping
        #[arg(long, value_name = "SECS")]
        release_after: Option<f64>,
    },
    /// Set a single valve to branch A or B
    Valve {
        /// Valve letter from address_map
        letter: String,
        #[arg(value_enum)]
        branch: BranchArg,
    },
    /// Run the timed mix program from [program]
    Program {
        /// Stop after this many seconds instead of running to completion
        #[arg(long, value_name = "SECS")]
        max_secs: Option<f64>,
    },
    /// Print identity strings and the stored config record of a board
    Info {
        #[arg(long, value_name = "ADDR")]
        address: u8,
    },
    /// Configure a board's pin modes/levels for pump duty and reload it
    InitBoard {
        #[arg(long, value_name = "ADDR")]
        address: u8,
        /// Move the board to this address
        #[arg(long, value_name = "ADDR")]
        new_address: Option<u8>,
    },
    /// Blink a board's outputs so it can be found on the rig
    Identify {
        #[arg(long, value_name = "ADDR")]
        address: u8,
    },
    /// Check that every configured board answers
    SelfCheck,
}

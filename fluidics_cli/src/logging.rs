//! Console and optional rolling-file tracing setup.

use crate::cli::FILE_GUARD;
use eyre::{WrapErr, bail, eyre};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

fn rotation(name: Option<&str>) -> eyre::Result<Rotation> {
    Ok(match name.unwrap_or("never") {
        "never" => Rotation::NEVER,
        "daily" => Rotation::DAILY,
        "hourly" => Rotation::HOURLY,
        other => bail!("logging.rotation must be never|daily|hourly, got '{other}'"),
    })
}

/// Install the global subscriber.
///
/// Console output goes to stderr so stdout only carries command results.
/// `RUST_LOG` wins over `--log-level` for the console. When `logging.file`
/// is set, JSON lines are also appended there through a non-blocking writer
/// whose guard lives in [`FILE_GUARD`].
pub fn init_tracing(json: bool, level: &str, cfg: &fluidics_config::Logging) -> eyre::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("invalid log level '{level}'"))?;
    let console = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    }
    .with_filter(console_filter);

    let file = match cfg.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .ok_or_else(|| eyre!("logging.file {path:?} has no file name"))?
                .to_string_lossy()
                .into_owned();
            let appender = RollingFileAppender::builder()
                .rotation(rotation(cfg.rotation.as_deref())?)
                .filename_prefix(prefix)
                .build(dir)
                .wrap_err_with(|| format!("open log file {path:?}"))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            let file_filter = EnvFilter::try_new(cfg.level.as_deref().unwrap_or("info"))
                .wrap_err("invalid logging.level")?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| eyre!("install tracing subscriber: {e}"))
}

//! Tracing subscriber setup for the daemon.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;
use crate::error::{Result, VigilError};

/// File name prefix for rotated log files (`vigil.log.2026-03-14`).
pub const LOG_FILE_PREFIX: &str = "vigil.log";

/// Parse a filter directive such as `"vigil=debug,warn"`.
///
/// # Errors
///
/// Returns [`VigilError::Config`] for an invalid directive.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| VigilError::Config(format!("invalid log filter '{directive}': {e}")))
}

/// Install the global subscriber: stderr, plus daily-rotated files when
/// enabled. `RUST_LOG` overrides the configured filter.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
///
/// # Errors
///
/// Returns an error for an invalid filter, an uncreatable log directory,
/// or when a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.filter)?,
    };
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(true);

    let (file_layer, guard) = if config.file_enabled {
        let dir = config.file_dir_path();
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init()
        .map_err(|e| VigilError::Config(format!("cannot install tracing subscriber: {e}")))?;
    Ok(guard)
}

//! Logging setup for the `uvmboot` binary.
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `info`). With a log
//! directory, a non-ANSI copy is also written to `uvmboot.log` in it.
//!
//! Keep the returned [`LogGuard`] alive until exit so buffered file output
//! is flushed.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uvmlite_shared::errors::{UvmError, UvmResult};

pub const LOG_FILE_NAME: &str = "uvmboot.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed or the
/// log directory cannot be created.
pub fn init_logging(log_dir: Option<&Path>) -> UvmResult<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                UvmError::Config(format!("failed to create log directory {}: {e}", dir.display()))
            })?;
            let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .map_err(|e| UvmError::Config(format!("failed to install logger: {e}")))?;
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .map_err(|e| UvmError::Config(format!("failed to install logger: {e}")))?;
            None
        }
    };

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

//! Tracing subscriber setup, driven by the `[logging]` config section.
//!
//! With a `logs_dir` configured, logs go to a daily-rotated JSON file plus
//! human-readable stderr; without one, stderr only. `RUST_LOG` overrides
//! the configured level either way. The library itself only emits `tracing`
//! events — a host embedding it can skip this module entirely and install
//! its own subscriber.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Holds the non-blocking writer guard for file logging.
///
/// Keep it alive for the life of the process; dropping it flushes pending
/// entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the global tracing subscriber per the given configuration.
///
/// Returns a [`LoggingGuard`] when a file layer was set up (`logs_dir`
/// configured); the caller must hold it for the life of the process. In
/// console-only mode there is nothing to flush and `None` is returned.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<LoggingGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let Some(logs_dir) = &config.logs_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        return Ok(None);
    };

    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "straylight.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(Some(LoggingGuard { _guard: guard }))
}

//! Logging initialization
//!
//! Binds the `tracing` subscriber according to the configured level and
//! destinations. Called once at startup; all components then log through
//! `tracing` macros with structured fields.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::conf::{LogDestination, LogLevel};
use crate::error::{Error, Result};

/// Initialize the global tracing subscriber.
///
/// `destinations` selects stdout and/or a file sink; `log_file` is only used
/// when [`LogDestination::File`] is present. Returns an error if the log
/// file cannot be opened or a subscriber is already installed.
pub fn init_logging(
    level: LogLevel,
    destinations: &[LogDestination],
    log_file: &Path,
) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    let stdout_layer = if destinations.contains(&LogDestination::Stdout) {
        Some(fmt::layer().with_target(false))
    } else {
        None
    };

    let file_layer = if destinations.contains(&LogDestination::File) {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(std::sync::Arc::new(file)),
        )
    } else {
        None
    };

    registry
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Conf(format!("failed to install logger: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");

        // First initialization in the process wins; a second one errors.
        // Both outcomes are acceptable here since test ordering is not fixed.
        let res = init_logging(LogLevel::Debug, &[LogDestination::File], &path);
        if res.is_ok() {
            assert!(path.exists());
        }
    }
}

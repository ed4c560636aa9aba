//! Crate-wide error types
//!
//! Errors are grouped by origin: configuration, authorization, path
//! lifecycle, stream delivery, I/O. Component-local failures are handled by
//! the owning control task; only terminal lifecycle errors cross component
//! boundaries.

use crate::auth::AuthError;
use crate::path::PathError;
use crate::stream::StreamError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration; fatal at startup
    #[error("invalid configuration: {0}")]
    Conf(String),

    /// Credentials or IP rejected
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Path lifecycle error (not found, not ready, already published, ...)
    #[error(transparent)]
    Path(#[from] PathError),

    /// Stream delivery error (overflow, unknown format, detached buffer)
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Transient I/O error; connection-local
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// State machine violation; logged and closes the affected path
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error terminates the session that observed it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Path(PathError::Terminated) | Error::Stream(StreamError::Detached)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Conf("bad credential".into());
        assert_eq!(err.to_string(), "invalid configuration: bad credential");

        let err = Error::from(PathError::Terminated);
        assert!(err.is_terminal());

        let err = Error::from(PathError::NotFound("cam1".into()));
        assert!(!err.is_terminal());
    }
}

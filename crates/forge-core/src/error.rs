use core::result::Result as CoreResult;
use std::io::{Error as IoError, ErrorKind};

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;
use toml::ser::Error as TomlSerError;

/// Result type for forge operations.
pub type Result<T> = CoreResult<T, Error>;

/// Execution errors raised by the validation tooling itself.
///
/// A generated project that fails a check is never reported through this
/// type; that outcome is data (`ValidationResult { success: false, .. }`).
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// TOML serialization failed.
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] TomlSerError),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A declared toolchain program could not be found.
    #[error("Toolchain not found: {0}")]
    ToolchainMissing(String),

    /// A toolchain process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying OS error
        source: IoError,
    },

    /// The run deadline elapsed.
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The run was canceled.
    #[error("Operation canceled")]
    Canceled,

    /// A pipeline instance is already executing.
    #[error("Pipeline is busy with another execution")]
    Busy,

    /// A planned stage has no registered validator.
    #[error("No validator registered for stage '{0}'")]
    UnknownStage(String),

    /// A validator failed to execute.
    #[error("Stage '{stage}' failed to execute: {message}")]
    StageExecution {
        /// Stage identifier
        stage: String,
        /// Description of the execution failure
        message: String,
    },

    /// A batch request is malformed.
    #[error("Invalid batch request: {0}")]
    InvalidRequest(String),

    /// A report could not be produced.
    #[error("Report error: {0}")]
    Report(String),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Determines whether this error may succeed if retried.
    ///
    /// Only plausibly transient execution failures qualify: process spawn
    /// failures (other than a missing program) and contended I/O.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => source.kind() != ErrorKind::NotFound,
            Self::Io(source) => matches!(
                source.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` when the error stems from cancellation or the deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::Timeout(_))
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect and unwrap"
)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, from_str};
    use std::io;

    #[test]
    fn test_error_display() {
        let error1 = Error::Config("timeout must be positive".to_owned());
        assert_eq!(
            error1.to_string(),
            "Configuration error: timeout must be positive"
        );

        let error2 = Error::UnknownStage("linting".to_owned());
        assert_eq!(
            error2.to_string(),
            "No validator registered for stage 'linting'"
        );

        assert_eq!(Error::Timeout(1500).to_string(), "Timeout after 1500ms");
    }

    #[test]
    fn test_error_is_retryable() {
        let spawn = Error::Spawn {
            program: "go".to_owned(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "busy"),
        };
        assert!(spawn.is_retryable());

        let interrupted = Error::Io(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(interrupted.is_retryable());

        let missing = Error::Spawn {
            program: "go".to_owned(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(!missing.is_retryable());
        assert!(!Error::ToolchainMissing("go".to_owned()).is_retryable());
        assert!(!Error::Canceled.is_retryable());
        assert!(!Error::Config("bad".to_owned()).is_retryable());
    }

    #[test]
    fn test_error_is_cancellation() {
        assert!(Error::Canceled.is_cancellation());
        assert!(Error::Timeout(10).is_cancellation());
        assert!(!Error::Busy.is_cancellation());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();
        assert!(matches!(error, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_error = from_str::<JsonValue>("invalid json").unwrap_err();
        let error: Error = json_error.into();
        assert!(matches!(error, Error::Json(_)));
    }
}

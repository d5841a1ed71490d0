//! Error types for errsift-core

use thiserror::Error;

/// Main error type for the errsift-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or inventory error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// A directory, file or remote session could not be reached
    #[error("source unavailable ({target}): {message}")]
    SourceUnavailable { target: String, message: String },

    /// Analysis collaborator failed or returned unusable output
    #[error("analysis error: {0}")]
    Analysis(String),

    /// Offset store error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH/SFTP protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A work unit exceeded its deadline
    #[error("timed out after {elapsed_secs}s: {stage}")]
    Timeout { stage: String, elapsed_secs: u64 },

    /// Notification delivery error
    #[error("notification error: {0}")]
    Notify(String),
}

impl Error {
    /// Convenience constructor for [`Error::SourceUnavailable`].
    pub fn unavailable(target: impl Into<String>, message: impl ToString) -> Self {
        Error::SourceUnavailable {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error must abort startup rather than fail a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

/// Result type alias for errsift-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(Error::Config("bad".to_string()).is_fatal());
        assert!(!Error::unavailable("/var/log", "missing").is_fatal());
        assert!(!Error::Analysis("boom".to_string()).is_fatal());
    }

    #[test]
    fn test_unavailable_message() {
        let err = Error::unavailable("host:22", "connection refused");
        assert_eq!(
            err.to_string(),
            "source unavailable (host:22): connection refused"
        );
    }
}

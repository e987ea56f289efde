//! Error types for the revision archive engine
//!
//! Only request-aborting conditions live here. Validation failures (unknown
//! revision, lock held by someone else, duplicate label) are reported through
//! the `failure_reason` of the operation's argument struct instead.

use std::path::PathBuf;

/// Result type for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors that abort the current request
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive corrupt: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for ArchiveError {
    fn from(e: bincode::Error) -> Self {
        ArchiveError::Serialization(e.to_string())
    }
}

impl ArchiveError {
    /// Build an invariant violation and log it loudly.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("invariant violation: {}", msg);
        ArchiveError::Invariant(msg)
    }
}

/// Argument structs that carry a validation failure back to the caller.
pub trait FailureReason {
    /// Mutable slot holding the reason for the last rejection.
    fn failure_reason_mut(&mut self) -> &mut Option<String>;

    /// Record a rejection and return `false` for convenient early returns.
    fn reject(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        tracing::debug!("operation rejected: {}", reason);
        *self.failure_reason_mut() = Some(reason);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Args {
        failure_reason: Option<String>,
    }

    impl FailureReason for Args {
        fn failure_reason_mut(&mut self) -> &mut Option<String> {
            &mut self.failure_reason
        }
    }

    #[test]
    fn test_reject_records_reason() {
        let mut args = Args { failure_reason: None };
        assert!(!args.reject("revision 1.7 not found"));
        assert_eq!(args.failure_reason.as_deref(), Some("revision 1.7 not found"));
    }

    #[test]
    fn test_error_display() {
        let err = ArchiveError::NotFound(PathBuf::from("/a/foo.txt.rva"));
        assert!(err.to_string().contains("/a/foo.txt.rva"));

        let err = ArchiveError::Corruption("bad checksum".to_string());
        assert!(err.to_string().contains("bad checksum"));
    }
}

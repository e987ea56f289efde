//! Error types for branch bookkeeping

use crate::catalog::BranchId;

/// Result type for branch operations
pub type Result<T> = std::result::Result<T, BranchError>;

#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    #[error("Branch already registered: {0}")]
    DuplicateBranch(BranchId),

    #[error("Branch name already in use: {0}")]
    DuplicateName(String),

    #[error("Notifier is shut down")]
    NotifierStopped,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(BranchError::UnknownBranch(BranchId(7)).to_string(), "Unknown branch: 7");
        assert!(BranchError::DuplicateName("feature".into())
            .to_string()
            .contains("feature"));
    }
}

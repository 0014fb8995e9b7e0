//! Domain error types
//!
//! This module defines error types specific to domain operations:
//! identifier and key validation, relative path checks and invalid
//! provider state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path (absolute, empty or escaping the sync root)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid identifier format
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Invalid key or secret material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("/abs".to_string());
        assert_eq!(err.to_string(), "Invalid path: /abs");

        let err = DomainError::InvalidState {
            from: "error".to_string(),
            to: "active".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid state transition from error to active");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidId("x".to_string());
        let err2 = DomainError::InvalidId("x".to_string());
        let err3 = DomainError::InvalidKey("x".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}

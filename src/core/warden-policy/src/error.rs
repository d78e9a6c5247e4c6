//! Policy error types.

use thiserror::Error;

/// Errors that can occur in the policy engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy not found.
    #[error("policy not found: {0}")]
    NotFound(String),

    /// Malformed policy document.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<warden_storage::StorageError> for PolicyError {
    fn from(e: warden_storage::StorageError) -> Self {
        PolicyError::Storage(e.to_string())
    }
}

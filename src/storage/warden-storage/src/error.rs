//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Unique-constraint collision (concurrent writers racing on the same
    /// row, e.g. the audit sequence).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection or migration error.
    #[error("connection error: {0}")]
    ConnectionFailed(String),

    /// Query execution error.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid input (bad key, malformed record).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

//! Seal error types.

use thiserror::Error;

/// Errors that can occur during seal operations.
#[derive(Debug, Error)]
pub enum SealError {
    /// Core is already initialized.
    #[error("core already initialized")]
    AlreadyInitialized,

    /// Core is not initialized.
    #[error("core not initialized")]
    NotInitialized,

    /// Core is sealed; the master key is unavailable.
    #[error("core is sealed")]
    Sealed,

    /// Core is already unsealed.
    #[error("core already unsealed")]
    AlreadyUnsealed,

    /// Invalid Shamir configuration.
    #[error("invalid seal config: {0}")]
    InvalidConfig(String),

    /// Malformed share.
    #[error("invalid share: {0}")]
    InvalidShare(String),

    /// Duplicate share submitted.
    #[error("duplicate share (index {0})")]
    DuplicateShare(u8),

    /// Collected shares reconstruct to something other than the master key.
    /// All pending shares have been discarded.
    #[error("submitted shares do not reconstruct the master key")]
    InvalidShareSet,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<warden_storage::StorageError> for SealError {
    fn from(e: warden_storage::StorageError) -> Self {
        SealError::Storage(e.to_string())
    }
}

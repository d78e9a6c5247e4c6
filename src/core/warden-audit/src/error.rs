//! Audit error types.

use thiserror::Error;

/// Errors that can occur in the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The core is sealed; the signing key is unavailable.
    #[error("core is sealed")]
    Sealed,

    /// Concurrent appenders exhausted the retry budget. The caller's
    /// protected operation must be treated as failed.
    #[error("audit append contention")]
    Contention,

    /// A verification pass found the chain broken; the log refuses
    /// further appends until a pass comes back clean.
    #[error("audit chain invalid")]
    ChainInvalid,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<warden_storage::StorageError> for AuditError {
    fn from(e: warden_storage::StorageError) -> Self {
        AuditError::Storage(e.to_string())
    }
}

impl From<warden_crypto::CryptoError> for AuditError {
    fn from(e: warden_crypto::CryptoError) -> Self {
        AuditError::Crypto(e.to_string())
    }
}

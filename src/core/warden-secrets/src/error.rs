//! Secrets engine error types.

use thiserror::Error;

/// Errors that can occur in the secrets engine.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Core is sealed; payloads cannot be decrypted or encrypted.
    #[error("core is sealed")]
    Sealed,

    /// Secret not found (or tombstoned).
    #[error("secret not found: {0}")]
    NotFound(String),

    /// Secret version not found.
    #[error("secret version not found: {path} v{version}")]
    VersionNotFound {
        /// Secret path.
        path: String,
        /// Version number.
        version: i64,
    },

    /// Policy evaluation refused the operation.
    #[error("access denied")]
    AccessDenied {
        /// Name of the denying policy, when one matched. Exposed only to
        /// admin callers.
        policy: Option<String>,
    },

    /// Invalid secret path.
    #[error("invalid secret path: {0}")]
    InvalidPath(String),

    /// Malformed payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Audit append failed; the protected operation did not commit.
    #[error("audit error: {0}")]
    Audit(String),
}

impl From<warden_storage::StorageError> for SecretsError {
    fn from(e: warden_storage::StorageError) -> Self {
        SecretsError::Storage(e.to_string())
    }
}

impl From<warden_crypto::CryptoError> for SecretsError {
    fn from(e: warden_crypto::CryptoError) -> Self {
        SecretsError::Crypto(e.to_string())
    }
}

impl From<warden_audit::AuditError> for SecretsError {
    fn from(e: warden_audit::AuditError) -> Self {
        SecretsError::Audit(e.to_string())
    }
}

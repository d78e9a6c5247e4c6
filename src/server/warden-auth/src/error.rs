//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Login failed. Deliberately carries no detail about which component
    /// was wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Token has expired.
    #[error("token expired")]
    TokenExpired,

    /// Token has been revoked (or its issuing role/secret id is gone).
    #[error("token revoked")]
    TokenRevoked,

    /// Token not found.
    #[error("token not found")]
    TokenNotFound,

    /// Missing authentication token.
    #[error("missing authentication token")]
    MissingToken,

    /// Role already exists.
    #[error("role already exists: {0}")]
    RoleExists(String),

    /// Role not found (admin surface only; login paths collapse into
    /// `InvalidCredentials`).
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// Invalid input (bad role name, bad options).
    #[error("invalid input: {0}")]
    InvalidInput(String),

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

impl From<warden_storage::StorageError> for AuthError {
    fn from(e: warden_storage::StorageError) -> Self {
        AuthError::Storage(e.to_string())
    }
}

impl From<warden_audit::AuditError> for AuthError {
    fn from(e: warden_audit::AuditError) -> Self {
        AuthError::Audit(e.to_string())
    }
}

//! Lease error types.

use thiserror::Error;

/// Errors that can occur in the lease manager.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Lease not found.
    #[error("lease not found: {0}")]
    NotFound(String),

    /// Lease has passed its expiry.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// Lease has been revoked.
    #[error("lease revoked: {0}")]
    LeaseRevoked(String),

    /// The lease already sits at its hard lifetime cap.
    #[error("lease at max TTL: {0}")]
    MaxTtlExceeded(String),

    /// Policy evaluation refused the operation.
    #[error("access denied")]
    AccessDenied {
        /// Name of the denying policy, when one matched.
        policy: Option<String>,
    },

    /// The credential backend is unreachable or refused the operation.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unknown dynamic role.
    #[error("unknown dynamic role: {0}")]
    UnknownRole(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Audit append failed; the protected operation did not commit.
    #[error("audit error: {0}")]
    Audit(String),
}

impl From<warden_storage::StorageError> for LeaseError {
    fn from(e: warden_storage::StorageError) -> Self {
        LeaseError::Storage(e.to_string())
    }
}

impl From<warden_audit::AuditError> for LeaseError {
    fn from(e: warden_audit::AuditError) -> Self {
        LeaseError::Audit(e.to_string())
    }
}

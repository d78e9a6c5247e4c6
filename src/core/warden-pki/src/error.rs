//! PKI engine error types.

use thiserror::Error;

/// Errors that can occur in the PKI engine.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Core is sealed; CA private keys cannot be unwrapped.
    #[error("core is sealed")]
    Sealed,

    /// No root CA has been generated yet.
    #[error("no root CA")]
    NoRootCa,

    /// Certificate not found.
    #[error("certificate not found: {0}")]
    NotFound(String),

    /// Certificate already revoked.
    #[error("certificate already revoked: {0}")]
    AlreadyRevoked(String),

    /// Signing parent not found.
    #[error("parent CA not found: {0}")]
    ParentNotFound(String),

    /// Signing parent is revoked.
    #[error("parent CA revoked: {0}")]
    ParentRevoked(String),

    /// Unsupported key algorithm or size.
    #[error("invalid key parameters: {0}")]
    InvalidKeyParams(String),

    /// Signature algorithm outside the accepted SHA-2 family (SHA-1 and
    /// weaker are rejected on presented certificates and CSRs).
    #[error("unsupported signature algorithm: {0}")]
    KeyAlgorithmUnsupported(String),

    /// Malformed or unusable CSR.
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Requested validity extends past the signing CA's expiry.
    #[error("requested validity exceeds the signing CA's")]
    ValidityExceedsCa,

    /// A CA private key could not be unwrapped.
    #[error("CA private key unavailable: {0}")]
    CaPrivateKeyUnavailable(String),

    /// Presented chain does not reach a trusted root.
    #[error("untrusted issuer")]
    UntrustedIssuer,

    /// Certificate outside its validity window.
    #[error("certificate expired or not yet valid")]
    Expired,

    /// A certificate in the presented chain is revoked.
    #[error("certificate revoked: {0}")]
    Revoked(String),

    /// A signature in the presented chain does not verify.
    #[error("certificate signature invalid")]
    SignatureInvalid,

    /// Malformed input (PEM, subject, identifiers).
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

impl From<warden_storage::StorageError> for PkiError {
    fn from(e: warden_storage::StorageError) -> Self {
        PkiError::Storage(e.to_string())
    }
}

impl From<warden_crypto::CryptoError> for PkiError {
    fn from(e: warden_crypto::CryptoError) -> Self {
        PkiError::Crypto(e.to_string())
    }
}

impl From<warden_audit::AuditError> for PkiError {
    fn from(e: warden_audit::AuditError) -> Self {
        PkiError::Audit(e.to_string())
    }
}

impl From<rcgen::Error> for PkiError {
    fn from(e: rcgen::Error) -> Self {
        PkiError::Crypto(e.to_string())
    }
}

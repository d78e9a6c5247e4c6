//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (tag mismatch or malformed blob).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid key format or size.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid share split configuration (N/K out of range).
    #[error("invalid share config: {0}")]
    InvalidShareConfig(String),

    /// Malformed share data.
    #[error("invalid share: {0}")]
    InvalidShare(String),

    /// Fewer distinct shares than the threshold requires.
    #[error("insufficient shares: need {needed}, got {got}")]
    InsufficientShares {
        /// Threshold required to reconstruct.
        needed: u8,
        /// Distinct shares provided.
        got: usize,
    },

    /// The same share index was submitted more than once.
    #[error("duplicate share (index {0})")]
    DuplicateShare(u8),

    /// Shares from different splits (version or layout mismatch).
    #[error("incompatible share: {0}")]
    IncompatibleShare(String),
}

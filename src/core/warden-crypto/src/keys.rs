//! The master key and its lifecycle operations.
//!
//! The master key is the 32-byte root of trust: generated once at
//! initialization, split into GF(251) shares for the key holders, and
//! reconstructed from a threshold of shares at unseal time. It is never
//! persisted; what storage keeps is an HMAC verification tag so a
//! reconstruction from the wrong share set can be detected before the
//! key is trusted.
//!
//! Components never use the master key directly. Each derives its own
//! subkey under a context label (`"audit-hmac"`, `"secrets-engine"`,
//! `"pki-ca-keys"`), so compromising one subkey exposes neither the
//! master key nor a sibling's material.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;
use crate::hash::{constant_time_eq, hmac_sha256};
use crate::kdf::derive_encryption_key;
use crate::random::generate_key;
use crate::shamir::{self, Share};

/// The 32-byte root key. Exists in process memory only while the core is
/// unsealed; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Generates a fresh master key from the OS CSPRNG.
    pub fn generate() -> Self {
        let key = generate_key();
        Self { bytes: *key }
    }

    /// Rebuilds a master key from raw bytes (an unwrapped or derived copy).
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` unless the input is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);

        Ok(Self { bytes: key_bytes })
    }

    /// Splits the key into `total` shares with reconstruction threshold
    /// `threshold`, in the versioned GF(251) share format.
    pub fn split(&self, total: u8, threshold: u8) -> Result<Vec<Share>, CryptoError> {
        shamir::split(&self.bytes, total, threshold)
    }

    /// Reconstructs a master key from `threshold` distinct shares.
    ///
    /// Share-set errors (`InsufficientShares`, `DuplicateShare`,
    /// `IncompatibleShare`) pass through; shares that combine to anything
    /// other than 32 bytes are rejected as `InvalidKey`. The caller must
    /// still check the result against the persisted verification tag, a
    /// consistent-but-wrong share set reconstructs cleanly.
    pub fn reconstruct(shares: &[Share], threshold: u8) -> Result<Self, CryptoError> {
        let secret = shamir::combine(shares, threshold)?;
        Self::from_bytes(&secret)
    }

    /// Computes the HMAC verification tag persisted at initialization and
    /// checked on every reconstruction.
    pub fn verification_tag(&self, context: &[u8]) -> [u8; 32] {
        hmac_sha256(&self.bytes, context)
    }

    /// Constant-time check of this key against a stored verification tag.
    pub fn matches_tag(&self, context: &[u8], expected: &[u8]) -> bool {
        constant_time_eq(&self.verification_tag(context), expected)
    }

    /// Derives the 32-byte subkey for a component's context label via
    /// HKDF-SHA256.
    pub fn derive_subkey(&self, context: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        derive_encryption_key(&self.bytes, context)
    }

    /// Raw key bytes, for HMAC keying at the call sites that need them.
    /// The returned slice is not zeroized automatically.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reconstruct_roundtrip() {
        let key = MasterKey::generate();

        let shares = key.split(5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let rebuilt = MasterKey::reconstruct(&shares[1..4], 3).unwrap();
        assert_eq!(rebuilt.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_reconstruct_below_threshold_fails() {
        let key = MasterKey::generate();
        let shares = key.split(5, 3).unwrap();

        let result = MasterKey::reconstruct(&shares[..2], 3);
        assert!(matches!(
            result,
            Err(CryptoError::InsufficientShares { .. })
        ));
    }

    #[test]
    fn test_verification_tag_detects_foreign_key() {
        let key = MasterKey::generate();
        let other = MasterKey::generate();
        let tag = key.verification_tag(b"warden-seal-verify-v1");

        assert!(key.matches_tag(b"warden-seal-verify-v1", &tag));
        assert!(!other.matches_tag(b"warden-seal-verify-v1", &tag));
        // Same key, different domain tag: no match either.
        assert!(!key.matches_tag(b"some-other-context", &tag));
    }

    #[test]
    fn test_wrong_share_set_reconstructs_but_fails_tag() {
        let key_a = MasterKey::generate();
        let key_b = MasterKey::generate();
        let tag_a = key_a.verification_tag(b"warden-seal-verify-v1");

        let shares_b = key_b.split(3, 2).unwrap();
        if let Ok(rebuilt) = MasterKey::reconstruct(&shares_b[..2], 2) {
            assert!(!rebuilt.matches_tag(b"warden-seal-verify-v1", &tag_a));
        }
    }

    #[test]
    fn test_subkeys_are_domain_separated() {
        let key = MasterKey::generate();

        let audit = key.derive_subkey(b"audit-hmac").unwrap();
        let secrets = key.derive_subkey(b"secrets-engine").unwrap();
        let pki = key.derive_subkey(b"pki-ca-keys").unwrap();

        assert_ne!(*audit, *secrets);
        assert_ne!(*secrets, *pki);

        // Deterministic per context: the same subkey comes back after a
        // seal/unseal cycle.
        let audit_again = key.derive_subkey(b"audit-hmac").unwrap();
        assert_eq!(*audit, *audit_again);
    }

    #[test]
    fn test_from_bytes_length_checked() {
        assert!(MasterKey::from_bytes(&[0u8; 16]).is_err());
        assert!(MasterKey::from_bytes(&[0u8; KEY_SIZE]).is_ok());
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_debug_redacted() {
        let key = MasterKey::from_bytes(&[0x42u8; KEY_SIZE]).unwrap();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("42"));
    }
}

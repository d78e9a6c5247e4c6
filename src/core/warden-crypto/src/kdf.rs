//! Key derivation functions.
//!
//! Two derivation families are used in Warden:
//! - HKDF-SHA256 (RFC 5869) for domain-separated subkeys of the master key
//!   (`"audit-hmac"`, `"secrets-engine"`, `"pki-ca-keys"`).
//! - PBKDF2-HMAC-SHA256 for password-grade inputs, 100,000 iterations.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// PBKDF2 salt size in bytes.
pub const PBKDF2_SALT_SIZE: usize = 16;

/// Derives a key using HKDF-SHA256.
///
/// # Arguments
///
/// * `ikm` - Input key material (the secret to derive from)
/// * `salt` - Optional salt value
/// * `info` - Context and application-specific information
/// * `length` - Desired output key length in bytes
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 {
        return Err(CryptoError::InvalidInput(
            "output length must be > 0".to_string(),
        ));
    }

    if length > 255 * 32 {
        return Err(CryptoError::InvalidInput(
            "output length too large for HKDF-SHA256".to_string(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyGenerationFailed("HKDF expansion failed".to_string()))?;

    Ok(okm)
}

/// Derives an AES-256 encryption key using HKDF-SHA256.
///
/// Convenience wrapper around `derive_key` that returns exactly 32 bytes.
/// Each component derives under its own context string so a compromise of
/// one subkey does not expose another.
pub fn derive_encryption_key(
    master_key: &[u8],
    context: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let derived = derive_key(master_key, None, context, KEY_SIZE)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&derived);

    Ok(key)
}

/// Derives a 32-byte key from a password with PBKDF2-HMAC-SHA256.
///
/// # Arguments
///
/// * `password` - Password or low-entropy input
/// * `salt` - 16-byte random salt, stored alongside the derived output
pub fn pbkdf2_derive(
    password: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    if salt.len() != PBKDF2_SALT_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "salt must be {} bytes, got {}",
            PBKDF2_SALT_SIZE,
            salt.len()
        )));
    }

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut *out);

    Ok(out)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_basic() {
        let key = derive_key(b"input key material", None, b"context", 32).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let key1 = derive_key(b"ikm", None, b"context", 32).unwrap();
        let key2 = derive_key(b"ikm", None, b"context", 32).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_derive_key_different_info_different_keys() {
        let key1 = derive_key(b"ikm", None, b"audit-hmac", 32).unwrap();
        let key2 = derive_key(b"ikm", None, b"secrets-engine", 32).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_derive_encryption_key() {
        let key = derive_encryption_key(b"master secret", b"secrets-engine").unwrap();
        assert_eq!(key.len(), KEY_SIZE);
    }

    #[test]
    fn test_derive_key_zero_length_fails() {
        let result = derive_key(b"input", None, b"info", 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_hkdf_rfc5869_test_vector() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = derive_key(&ikm, Some(&salt), &info, 42).unwrap();

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();

        assert_eq!(&*okm, &expected);
    }

    #[test]
    fn test_pbkdf2_deterministic() {
        let salt = [7u8; PBKDF2_SALT_SIZE];

        let key1 = pbkdf2_derive(b"hunter2", &salt).unwrap();
        let key2 = pbkdf2_derive(b"hunter2", &salt).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_pbkdf2_salt_sensitivity() {
        let key1 = pbkdf2_derive(b"hunter2", &[1u8; PBKDF2_SALT_SIZE]).unwrap();
        let key2 = pbkdf2_derive(b"hunter2", &[2u8; PBKDF2_SALT_SIZE]).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_pbkdf2_bad_salt_length() {
        let result = pbkdf2_derive(b"pw", &[0u8; 8]);
        assert!(matches!(result, Err(CryptoError::InvalidInput(_))));
    }
}

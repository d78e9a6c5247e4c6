//! AES-256-GCM authenticated encryption with context binding.
//!
//! Every blob Warden persists is encrypted under a purpose-derived subkey
//! and additionally bound to a context via AEAD associated data: secret
//! payloads bind their storage path, wrapped CA keys bind the key-wrap
//! label. A ciphertext moved to a different row or presented under the
//! wrong purpose fails authentication even when the key would match.
//!
//! Persisted layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The context is never stored; both sides already know it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }

    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypts `plaintext` bound to `context`, with a fresh random nonce.
///
/// The context is authenticated but not encrypted or stored; decryption
/// must present the identical bytes.
pub fn encrypt(key: &[u8], context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce_bytes = generate_nonce();

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: context,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&sealed);

    Ok(blob)
}

/// Decrypts a blob produced by [`encrypt`] under the same key and context.
///
/// Any mismatch, a flipped bit anywhere in the blob, a different context,
/// a different key, yields `DecryptionFailed`. Plaintext comes back in
/// `Zeroizing` so it is erased when dropped.
pub fn decrypt(
    key: &[u8],
    context: &[u8],
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher_for(key)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed("blob too short".to_string()));
    }

    let (nonce_bytes, sealed) = blob.split_at(NONCE_SIZE);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: sealed,
                aad: context,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

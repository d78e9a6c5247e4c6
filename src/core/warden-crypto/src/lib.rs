//! # Warden Crypto
//!
//! Core cryptographic primitives for Warden.
//!
//! This crate provides low-level cryptographic operations including:
//! - Context-bound symmetric encryption (AES-256-GCM with AEAD binding)
//! - Key derivation (HKDF-SHA256 and PBKDF2-HMAC-SHA256)
//! - The master key lifecycle (generate, split, reconstruct, derive)
//! - Shamir secret sharing over GF(251)
//! - Hashing and HMAC signing (SHA-256 family)
//! - Secure random generation (OS CSPRNG)
//!
//! ## Security
//!
//! All sensitive key material is automatically zeroized when dropped.
//! Keys implement `Debug` with redacted output to prevent accidental logging.
//!
//! ## Example
//!
//! ```
//! use warden_crypto::{aead, MasterKey};
//!
//! // Derive a component subkey and encrypt a payload bound to its path.
//! let master = MasterKey::generate();
//! let key = master.derive_subkey(b"secrets-engine").unwrap();
//!
//! let blob = aead::encrypt(&*key, b"db/prod", b"payload").unwrap();
//! let plain = aead::decrypt(&*key, b"db/prod", &blob).unwrap();
//!
//! assert_eq!(&*plain, b"payload");
//!
//! // The same blob under another path fails authentication.
//! assert!(aead::decrypt(&*key, b"db/staging", &blob).is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod random;
pub mod shamir;

pub use error::CryptoError;
pub use keys::MasterKey;
pub use shamir::Share;

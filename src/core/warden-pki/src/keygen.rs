//! Key generation and CA key wrapping.

use rcgen::KeyPair;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

use warden_crypto::aead;
use warden_seal::KeyAccess;

use crate::error::PkiError;

/// Context label for the CA key-wrapping subkey; doubles as the AEAD
/// binding on wrapped keys, so a wrapped CA key cannot be replayed as any
/// other kind of blob.
const CA_KEY_CONTEXT: &[u8] = b"pki-ca-keys";

/// Supported key algorithms for CA and issued certificates; each pairs
/// with its SHA-2 signature scheme, so this engine never produces a
/// SHA-1 signature. Externally presented chains and CSRs are held to the
/// same bar by the signature-algorithm allowlist in [`crate::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA with SHA-256 signatures.
    Rsa {
        /// Modulus size; 2048 or 4096.
        bits: u32,
    },
    /// ECDSA P-384 with SHA-384 signatures.
    EcdsaP384,
}

impl KeyAlgorithm {
    /// Parses `(key_type, key_bits)` request fields.
    pub fn from_request(key_type: &str, key_bits: Option<u32>) -> Result<Self, PkiError> {
        match key_type {
            "rsa" => match key_bits.unwrap_or(2048) {
                bits @ (2048 | 4096) => Ok(Self::Rsa { bits }),
                bits => Err(PkiError::InvalidKeyParams(format!(
                    "unsupported RSA size {bits}, expected 2048 or 4096"
                ))),
            },
            "ecdsa" | "ecdsa-p384" => Ok(Self::EcdsaP384),
            other => Err(PkiError::InvalidKeyParams(format!(
                "unsupported key type {other}"
            ))),
        }
    }
}

/// Generates a key pair for the given algorithm.
///
/// RSA keys come from the `rsa` crate and are imported into `rcgen`
/// through their PKCS#8 encoding; P-384 keys are generated natively.
pub fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair, PkiError> {
    match algorithm {
        KeyAlgorithm::Rsa { bits } => {
            let mut rng = rand::rngs::OsRng;
            let private = RsaPrivateKey::new(&mut rng, bits as usize)
                .map_err(|e| PkiError::Crypto(format!("RSA generation failed: {e}")))?;

            let der = private
                .to_pkcs8_der()
                .map_err(|e| PkiError::Crypto(format!("PKCS#8 encoding failed: {e}")))?;

            KeyPair::try_from(der.as_bytes())
                .map_err(|e| PkiError::Crypto(format!("RSA import failed: {e}")))
        }
        KeyAlgorithm::EcdsaP384 => {
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).map_err(PkiError::from)
        }
    }
}

/// AEAD-wraps a CA private key (PKCS#8 DER) under the master key.
pub fn wrap_ca_key(keys: &KeyAccess, key_der: &[u8]) -> Result<Vec<u8>, PkiError> {
    let master = keys.master_key().map_err(|_| PkiError::Sealed)?;
    let wrap_key = master.derive_subkey(CA_KEY_CONTEXT)?;
    Ok(aead::encrypt(&*wrap_key, CA_KEY_CONTEXT, key_der)?)
}

/// Unwraps a CA private key and re-imports it as a signing key pair.
pub fn unwrap_ca_key(keys: &KeyAccess, wrapped: &[u8]) -> Result<KeyPair, PkiError> {
    let master = keys.master_key().map_err(|_| PkiError::Sealed)?;
    let wrap_key = master.derive_subkey(CA_KEY_CONTEXT)?;

    let der = aead::decrypt(&*wrap_key, CA_KEY_CONTEXT, wrapped)
        .map_err(|e| PkiError::CaPrivateKeyUnavailable(e.to_string()))?;

    KeyPair::try_from(der.as_slice())
        .map_err(|e| PkiError::CaPrivateKeyUnavailable(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(
            KeyAlgorithm::from_request("rsa", Some(2048)).unwrap(),
            KeyAlgorithm::Rsa { bits: 2048 }
        );
        assert_eq!(
            KeyAlgorithm::from_request("rsa", None).unwrap(),
            KeyAlgorithm::Rsa { bits: 2048 }
        );
        assert_eq!(
            KeyAlgorithm::from_request("ecdsa", None).unwrap(),
            KeyAlgorithm::EcdsaP384
        );
        assert!(KeyAlgorithm::from_request("rsa", Some(1024)).is_err());
        assert!(KeyAlgorithm::from_request("ed448", None).is_err());
    }

    #[test]
    fn test_generate_p384() {
        let key = generate_key_pair(KeyAlgorithm::EcdsaP384).unwrap();
        assert!(!key.serialize_der().is_empty());
    }

    #[test]
    fn test_generate_rsa_2048() {
        let key = generate_key_pair(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
        assert!(!key.serialize_der().is_empty());
    }
}

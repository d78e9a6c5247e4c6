//! Certificate parsing and signature checks.
//!
//! Pure helpers over `x509-parser`; the chain walk itself lives on the
//! engine because revocation lookups hit storage.

use chrono::{DateTime, Utc};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use warden_crypto::hash::sha256_hex;

use crate::error::PkiError;

/// Signature algorithm OIDs accepted on certificates and CSRs: SHA-2 with
/// RSA or ECDSA, RSASSA-PSS, and Ed25519. Everything else, notably the
/// SHA-1 and MD5 era algorithms, is rejected before any cryptographic
/// check runs.
const ALLOWED_SIGNATURE_OIDS: &[&str] = &[
    "1.2.840.113549.1.1.11", // sha256WithRSAEncryption
    "1.2.840.113549.1.1.12", // sha384WithRSAEncryption
    "1.2.840.113549.1.1.13", // sha512WithRSAEncryption
    "1.2.840.113549.1.1.10", // RSASSA-PSS
    "1.2.840.10045.4.3.2",   // ecdsa-with-SHA256
    "1.2.840.10045.4.3.3",   // ecdsa-with-SHA384
    "1.2.840.10045.4.3.4",   // ecdsa-with-SHA512
    "1.3.101.112",           // Ed25519
];

fn signature_algorithm_allowed(oid: &str) -> bool {
    ALLOWED_SIGNATURE_OIDS.contains(&oid)
}

fn check_signature_algorithm(cert: &X509Certificate<'_>) -> Result<(), PkiError> {
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    if signature_algorithm_allowed(&oid) {
        Ok(())
    } else {
        Err(PkiError::KeyAlgorithmUnsupported(oid))
    }
}

/// Rejects CSRs signed with an algorithm outside the SHA-2 allowlist
/// before any signing work happens.
pub fn check_csr_signature_algorithm(csr_pem: &str) -> Result<(), PkiError> {
    let (_, parsed) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| PkiError::InvalidCsr(format!("bad PEM: {e}")))?;

    let (_, csr) = X509CertificationRequest::from_der(&parsed.contents)
        .map_err(|e| PkiError::InvalidCsr(format!("bad CSR DER: {e}")))?;

    let oid = csr.signature_algorithm.algorithm.to_id_string();
    if signature_algorithm_allowed(&oid) {
        Ok(())
    } else {
        Err(PkiError::KeyAlgorithmUnsupported(oid))
    }
}

/// Identity extracted from a verified peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Entity identifier: SAN URI, SAN DNS name, or subject CN.
    pub principal: String,
    /// SHA-256 fingerprint of the DER certificate, lowercase hex.
    pub fingerprint: String,
    /// Serial number, lowercase hex.
    pub serial: String,
}

/// Decodes a single PEM certificate to DER.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, PkiError> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| PkiError::InvalidInput(format!("bad PEM: {e}")))?;
    if parsed.label != "CERTIFICATE" {
        return Err(PkiError::InvalidInput(format!(
            "unexpected PEM label {}",
            parsed.label
        )));
    }
    Ok(parsed.contents)
}

/// SHA-256 fingerprint of a PEM certificate's DER encoding.
pub fn fingerprint(pem: &str) -> Result<String, PkiError> {
    Ok(sha256_hex(&pem_to_der(pem)?))
}

fn with_cert<T>(
    der: &[u8],
    f: impl FnOnce(&X509Certificate<'_>) -> Result<T, PkiError>,
) -> Result<T, PkiError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::InvalidInput(format!("bad certificate DER: {e}")))?;
    f(&cert)
}

/// Checks the validity window at `now`.
pub fn check_validity(pem: &str, now: DateTime<Utc>) -> Result<(), PkiError> {
    let der = pem_to_der(pem)?;
    with_cert(&der, |cert| {
        let at = x509_parser::time::ASN1Time::from_timestamp(now.timestamp())
            .map_err(|e| PkiError::InvalidInput(e.to_string()))?;
        if cert.validity().is_valid_at(at) {
            Ok(())
        } else {
            Err(PkiError::Expired)
        }
    })
}

/// Whether `issuer_pem`'s subject matches `child_pem`'s issuer, by raw DN.
pub fn issuer_matches(child_pem: &str, issuer_pem: &str) -> Result<bool, PkiError> {
    let child_der = pem_to_der(child_pem)?;
    let issuer_der = pem_to_der(issuer_pem)?;

    with_cert(&child_der, |child| {
        let child_issuer = child.tbs_certificate.issuer.as_raw().to_vec();
        with_cert(&issuer_der, |issuer| {
            Ok(child_issuer == issuer.tbs_certificate.subject.as_raw())
        })
    })
}

/// Verifies `child_pem`'s signature against `issuer_pem`'s public key.
/// Pass the certificate itself as issuer for self-signed roots.
///
/// The child's signature algorithm is checked against the SHA-2 allowlist
/// first: a certificate validly signed with SHA-1 is rejected outright,
/// not verified.
pub fn verify_signed_by(child_pem: &str, issuer_pem: &str) -> Result<(), PkiError> {
    let child_der = pem_to_der(child_pem)?;
    let issuer_der = pem_to_der(issuer_pem)?;

    with_cert(&child_der, |child| {
        check_signature_algorithm(child)?;
        with_cert(&issuer_der, |issuer| {
            child
                .verify_signature(Some(issuer.public_key()))
                .map_err(|_| PkiError::SignatureInvalid)
        })
    })
}

/// Whether the certificate is self-issued (subject equals issuer).
pub fn is_self_issued(pem: &str) -> Result<bool, PkiError> {
    let der = pem_to_der(pem)?;
    with_cert(&der, |cert| {
        Ok(cert.tbs_certificate.subject.as_raw() == cert.tbs_certificate.issuer.as_raw())
    })
}

/// Extracts the subject common name.
pub fn subject_cn(pem: &str) -> Result<String, PkiError> {
    let der = pem_to_der(pem)?;
    with_cert(&der, |cert| {
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PkiError::InvalidInput("certificate has no CN".into()))
    })
}

/// Extracts the issuer common name.
pub fn issuer_cn(pem: &str) -> Result<String, PkiError> {
    let der = pem_to_der(pem)?;
    with_cert(&der, |cert| {
        Ok(cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_default())
    })
}

/// Serial number as lowercase hex.
pub fn serial_hex(pem: &str) -> Result<String, PkiError> {
    let der = pem_to_der(pem)?;
    with_cert(&der, |cert| {
        Ok(warden_crypto::hash::hex_encode(
            &cert.tbs_certificate.raw_serial().to_vec(),
        ))
    })
}

/// Extracts the peer identity: SAN URI first, then SAN DNS, then CN.
pub fn peer_identity(pem: &str) -> Result<PeerIdentity, PkiError> {
    let der = pem_to_der(pem)?;
    let fingerprint = sha256_hex(&der);

    with_cert(&der, |cert| {
        let mut principal = None;

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::URI(uri) => {
                        principal = Some((*uri).to_string());
                        break;
                    }
                    GeneralName::DNSName(dns) if principal.is_none() => {
                        principal = Some((*dns).to_string());
                    }
                    _ => {}
                }
            }
        }

        let principal = match principal {
            Some(p) => p,
            None => cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
                .ok_or_else(|| PkiError::InvalidInput("certificate has no identity".into()))?,
        };

        Ok(PeerIdentity {
            principal,
            fingerprint: fingerprint.clone(),
            serial: warden_crypto::hash::hex_encode(&cert.tbs_certificate.raw_serial().to_vec()),
        })
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn self_signed(cn: &str) -> (String, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key)
    }

    #[test]
    fn test_signature_algorithm_allowlist() {
        // SHA-2 family passes.
        assert!(signature_algorithm_allowed("1.2.840.113549.1.1.11"));
        assert!(signature_algorithm_allowed("1.2.840.113549.1.1.12"));
        assert!(signature_algorithm_allowed("1.2.840.10045.4.3.2"));
        assert!(signature_algorithm_allowed("1.2.840.10045.4.3.3"));
        assert!(signature_algorithm_allowed("1.3.101.112"));

        // SHA-1 and MD5 era algorithms are rejected.
        assert!(!signature_algorithm_allowed("1.2.840.113549.1.1.5")); // sha1WithRSA
        assert!(!signature_algorithm_allowed("1.2.840.10045.4.1")); // ecdsa-with-SHA1
        assert!(!signature_algorithm_allowed("1.2.840.113549.1.1.4")); // md5WithRSA
        assert!(!signature_algorithm_allowed("1.2.840.10040.4.3")); // dsa-with-SHA1
    }

    #[test]
    fn test_generated_certificates_pass_allowlist() {
        // rcgen signs with ecdsa-with-SHA256 here; the allowlist check
        // inside verify_signed_by must let it through.
        let (pem, _) = self_signed("sha2-signed");
        verify_signed_by(&pem, &pem).unwrap();
    }

    #[test]
    fn test_csr_algorithm_accepted() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "agent");
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();

        check_csr_signature_algorithm(&csr).unwrap();
    }

    #[test]
    fn test_csr_garbage_rejected() {
        assert!(matches!(
            check_csr_signature_algorithm("not a csr"),
            Err(PkiError::InvalidCsr(_))
        ));
    }

    #[test]
    fn test_pem_roundtrip_and_fingerprint() {
        let (pem, _) = self_signed("test-cert");

        let der = pem_to_der(&pem).unwrap();
        assert!(!der.is_empty());

        let fp = fingerprint(&pem).unwrap();
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_self_signed_verifies() {
        let (pem, _) = self_signed("self");

        assert!(is_self_issued(&pem).unwrap());
        verify_signed_by(&pem, &pem).unwrap();
        check_validity(&pem, Utc::now()).unwrap();
    }

    #[test]
    fn test_subject_cn() {
        let (pem, _) = self_signed("my-name");
        assert_eq!(subject_cn(&pem).unwrap(), "my-name");
    }

    #[test]
    fn test_unrelated_signature_fails() {
        let (pem_a, _) = self_signed("a");
        let (pem_b, _) = self_signed("b");

        let result = verify_signed_by(&pem_a, &pem_b);
        assert!(matches!(result, Err(PkiError::SignatureInvalid)));
    }

    #[test]
    fn test_peer_identity_falls_back_to_cn() {
        let (pem, _) = self_signed("agent-7");
        let identity = peer_identity(&pem).unwrap();
        assert_eq!(identity.principal, "agent-7");
        assert_eq!(identity.fingerprint.len(), 64);
    }

    #[test]
    fn test_bad_pem_rejected() {
        assert!(pem_to_der("not pem").is_err());
    }
}

//! # Warden PKI
//!
//! Certificate authority for the internal mutual-authentication mesh:
//! root/intermediate CA hierarchy, CSR signing, revocation, chain
//! retrieval, and peer verification.
//!
//! CA private keys exist on disk only AEAD-wrapped under a subkey of the
//! master key, so every signing operation requires the core to be
//! unsealed. Client private keys are generated by the requester and never
//! pass through the core at all; the core only ever sees CSRs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod keygen;
pub mod verify;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use warden_audit::{kind, Actor, AuditEvent, AuditLog, Outcome};
use warden_crypto::hash::{hex_encode, sha256_hex};
use warden_crypto::random::generate_serial;
use warden_seal::KeyAccess;
use warden_storage::records::{CertificateRecord, CertificateType};
use warden_storage_sqlite::{CoupledWrite, SqliteBackend};

pub use error::PkiError;
pub use keygen::KeyAlgorithm;
pub use verify::PeerIdentity;

/// Clock skew tolerance on issued certificates.
const NOT_BEFORE_SKEW_SECONDS: i64 = 60;

/// Maximum chain length accepted by `verify_peer`.
const MAX_CHAIN_DEPTH: usize = 8;

/// Parameters for CA generation.
#[derive(Debug, Clone)]
pub struct CaRequest {
    /// Subject common name.
    pub common_name: String,
    /// Subject organization.
    pub organization: String,
    /// `"rsa"` or `"ecdsa"`.
    pub key_type: String,
    /// RSA modulus size; ignored for ECDSA.
    pub key_bits: Option<u32>,
    /// Validity in days.
    pub validity_days: u32,
}

/// TLS identity for the core's own listeners.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Leaf certificate, PEM.
    pub certificate_pem: String,
    /// Private key, PEM. Never persisted.
    pub private_key_pem: String,
    /// Intermediates to present alongside the leaf, PEM (may be empty).
    pub chain_pem: String,
    /// Full CA chain clients should trust, PEM.
    pub ca_chain_pem: String,
}

/// A signed client certificate plus the chain to verify it against.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// Stored record.
    pub record: CertificateRecord,
    /// The certificate, PEM.
    pub certificate_pem: String,
    /// Concatenated CA chain (intermediates then root), PEM.
    pub ca_chain_pem: String,
}

/// The certificate authority engine.
#[derive(Clone)]
pub struct CertificateAuthority {
    backend: SqliteBackend,
    keys: KeyAccess,
    audit: Arc<AuditLog>,
}

impl CertificateAuthority {
    /// Creates the engine over storage, the master key capability and the
    /// audit log.
    pub fn new(backend: SqliteBackend, keys: KeyAccess, audit: Arc<AuditLog>) -> Self {
        Self {
            backend,
            keys,
            audit,
        }
    }

    /// Generates a self-signed root CA and persists it with a wrapped key.
    pub async fn generate_root_ca(
        &self,
        request: &CaRequest,
        actor: &Actor,
    ) -> Result<CertificateRecord, PkiError> {
        let algorithm = KeyAlgorithm::from_request(&request.key_type, request.key_bits)?;
        let key_pair = keygen::generate_key_pair(algorithm)?;

        let now = Utc::now();
        let serial_bytes = generate_serial();
        let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
        let not_after = not_before + Duration::days(i64::from(request.validity_days));

        let mut params = CertificateParams::default();
        params.distinguished_name = dn(&request.common_name, &request.organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        params.not_before = to_validity_time(not_before)?;
        params.not_after = to_validity_time(not_after)?;

        let certificate = params.self_signed(&key_pair)?;
        let pem = certificate.pem();

        let wrapped_key = keygen::wrap_ca_key(&self.keys, key_pair.serialize_der().as_slice())?;

        let record = CertificateRecord {
            id: Uuid::new_v4(),
            serial: hex_encode(&serial_bytes),
            cert_type: CertificateType::RootCa,
            certificate_pem: pem,
            encrypted_private_key: Some(wrapped_key),
            fingerprint: sha256_hex(certificate.der().as_ref()),
            subject: request.common_name.clone(),
            issuer: request.common_name.clone(),
            issuer_id: None,
            not_before,
            not_after,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        self.backend.insert_certificate(&record).await?;
        self.audit_issue(actor, &record).await?;

        info!(subject = %record.subject, serial = %record.serial, "Root CA generated");

        Ok(record)
    }

    /// Generates an intermediate CA signed by the given root.
    pub async fn generate_intermediate_ca(
        &self,
        request: &CaRequest,
        parent_root_id: Uuid,
        actor: &Actor,
    ) -> Result<CertificateRecord, PkiError> {
        let parent = self
            .backend
            .get_certificate(parent_root_id)
            .await?
            .ok_or_else(|| PkiError::ParentNotFound(parent_root_id.to_string()))?;

        if parent.cert_type != CertificateType::RootCa {
            return Err(PkiError::ParentNotFound(format!(
                "{parent_root_id} is not a root CA"
            )));
        }
        if parent.revoked {
            return Err(PkiError::ParentRevoked(parent_root_id.to_string()));
        }

        let (issuer_cert, issuer_key) = self.load_issuer(&parent)?;

        let algorithm = KeyAlgorithm::from_request(&request.key_type, request.key_bits)?;
        let key_pair = keygen::generate_key_pair(algorithm)?;

        let now = Utc::now();
        let serial_bytes = generate_serial();
        let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
        // Intermediates are clamped to the root's lifetime.
        let not_after =
            (not_before + Duration::days(i64::from(request.validity_days))).min(parent.not_after);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn(&request.common_name, &request.organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        params.not_before = to_validity_time(not_before)?;
        params.not_after = to_validity_time(not_after)?;

        let certificate = params.signed_by(&key_pair, &issuer_cert, &issuer_key)?;
        let pem = certificate.pem();

        let wrapped_key = keygen::wrap_ca_key(&self.keys, key_pair.serialize_der().as_slice())?;

        let record = CertificateRecord {
            id: Uuid::new_v4(),
            serial: hex_encode(&serial_bytes),
            cert_type: CertificateType::IntermediateCa,
            certificate_pem: pem,
            encrypted_private_key: Some(wrapped_key),
            fingerprint: sha256_hex(certificate.der().as_ref()),
            subject: request.common_name.clone(),
            issuer: parent.subject.clone(),
            issuer_id: Some(parent.id),
            not_before,
            not_after,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        self.backend.insert_certificate(&record).await?;
        self.audit_issue(actor, &record).await?;

        info!(subject = %record.subject, issuer = %record.issuer, "Intermediate CA generated");

        Ok(record)
    }

    /// Signs a client CSR with the given CA.
    ///
    /// The requester keeps its private key; the core sets the serial,
    /// validity, and client-certificate extensions regardless of what the
    /// CSR asked for.
    pub async fn sign_csr(
        &self,
        csr_pem: &str,
        signing_ca_id: Uuid,
        cert_type: CertificateType,
        validity_days: u32,
        actor: &Actor,
    ) -> Result<SignedCertificate, PkiError> {
        if cert_type.is_ca() {
            return Err(PkiError::InvalidInput(
                "sign_csr issues client certificates only".into(),
            ));
        }

        let ca = self
            .backend
            .get_certificate(signing_ca_id)
            .await?
            .ok_or_else(|| PkiError::ParentNotFound(signing_ca_id.to_string()))?;

        if !ca.cert_type.is_ca() {
            return Err(PkiError::ParentNotFound(format!(
                "{signing_ca_id} is not a CA"
            )));
        }
        if ca.revoked {
            return Err(PkiError::ParentRevoked(signing_ca_id.to_string()));
        }

        // Weak request signatures are refused before any parsing by the
        // signing stack; an agent cannot smuggle a SHA-1 CSR through.
        verify::check_csr_signature_algorithm(csr_pem)?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(e.to_string()))?;

        let now = Utc::now();
        let serial_bytes = generate_serial();
        let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
        let not_after = not_before + Duration::days(i64::from(validity_days));

        if not_after > ca.not_after {
            return Err(PkiError::ValidityExceedsCa);
        }

        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.use_authority_key_identifier_extension = true;
        csr.params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        csr.params.not_before = to_validity_time(not_before)?;
        csr.params.not_after = to_validity_time(not_after)?;

        let (issuer_cert, issuer_key) = self.load_issuer(&ca)?;
        let certificate = csr.signed_by(&issuer_cert, &issuer_key)?;
        let pem = certificate.pem();

        let subject = verify::subject_cn(&pem).unwrap_or_else(|_| "unknown".to_string());

        let record = CertificateRecord {
            id: Uuid::new_v4(),
            serial: hex_encode(&serial_bytes),
            cert_type,
            certificate_pem: pem.clone(),
            encrypted_private_key: None,
            fingerprint: sha256_hex(certificate.der().as_ref()),
            subject,
            issuer: ca.subject.clone(),
            issuer_id: Some(ca.id),
            not_before,
            not_after,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        self.backend.insert_certificate(&record).await?;
        self.audit_issue(actor, &record).await?;

        let ca_chain_pem = self.get_ca_chain().await?;

        Ok(SignedCertificate {
            record,
            certificate_pem: pem,
            ca_chain_pem,
        })
    }

    /// Returns the concatenated CA chain: unrevoked intermediates first,
    /// then unrevoked roots.
    pub async fn get_ca_chain(&self) -> Result<String, PkiError> {
        let roots = self
            .backend
            .list_certificates(Some(CertificateType::RootCa))
            .await?;
        let intermediates = self
            .backend
            .list_certificates(Some(CertificateType::IntermediateCa))
            .await?;

        let mut chain = String::new();
        for cert in intermediates.iter().filter(|c| !c.revoked) {
            chain.push_str(cert.certificate_pem.trim_end());
            chain.push('\n');
        }

        let mut have_root = false;
        for cert in roots.iter().filter(|c| !c.revoked) {
            have_root = true;
            chain.push_str(cert.certificate_pem.trim_end());
            chain.push('\n');
        }

        if !have_root {
            return Err(PkiError::NoRootCa);
        }

        Ok(chain)
    }

    /// Revokes a certificate. The status flip and its audit record commit
    /// in one transaction. Idempotence is surfaced as `AlreadyRevoked`.
    pub async fn revoke(
        &self,
        certificate_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> Result<CertificateRecord, PkiError> {
        let record = self
            .backend
            .get_certificate(certificate_id)
            .await?
            .ok_or_else(|| PkiError::NotFound(certificate_id.to_string()))?;

        if record.revoked {
            return Err(PkiError::AlreadyRevoked(certificate_id.to_string()));
        }

        let revoked_at = Utc::now();
        let event = AuditEvent::new(
            kind::PKI_REVOKE,
            actor.clone(),
            format!("pki/{}", record.serial),
            Outcome::Success,
        )
        .with_meta("reason", reason)
        .with_meta("fingerprint", record.fingerprint.clone());

        self.audit
            .append_coupled(
                event,
                CoupledWrite::RevokeCertificate {
                    id: certificate_id,
                    revoked_at,
                    reason: reason.to_string(),
                },
            )
            .await
            .map_err(|e| match e {
                // The coupled update found no live row: a concurrent revoke won.
                warden_audit::AuditError::Storage(msg) if msg.contains("already revoked") => {
                    PkiError::AlreadyRevoked(certificate_id.to_string())
                }
                other => other.into(),
            })?;

        info!(serial = %record.serial, reason = %reason, "Certificate revoked");

        self.backend
            .get_certificate(certificate_id)
            .await?
            .ok_or_else(|| PkiError::NotFound(certificate_id.to_string()))
    }

    /// Verifies a presented peer certificate and its chain against the
    /// stored trust anchors: validity window, issuer signatures, and
    /// revocation status for every link.
    pub async fn verify_peer(
        &self,
        leaf_pem: &str,
        presented_chain: &[String],
    ) -> Result<PeerIdentity, PkiError> {
        let now = Utc::now();

        let roots: Vec<CertificateRecord> = self
            .backend
            .list_certificates(Some(CertificateType::RootCa))
            .await?;
        if roots.iter().all(|r| r.revoked) || roots.is_empty() {
            return Err(PkiError::NoRootCa);
        }
        let intermediates: Vec<CertificateRecord> = self
            .backend
            .list_certificates(Some(CertificateType::IntermediateCa))
            .await?;

        // Candidate issuers: the presented chain plus every stored CA.
        let mut pool: Vec<String> = presented_chain.to_vec();
        pool.extend(intermediates.iter().map(|c| c.certificate_pem.clone()));
        pool.extend(roots.iter().map(|c| c.certificate_pem.clone()));

        let trusted_root_fingerprints: Vec<String> = roots
            .iter()
            .filter(|r| !r.revoked)
            .map(|r| r.fingerprint.clone())
            .collect();

        let mut current = leaf_pem.to_string();

        for _ in 0..MAX_CHAIN_DEPTH {
            verify::check_validity(&current, now)?;
            self.check_revocation(&current).await?;

            let fp = verify::fingerprint(&current)?;
            if trusted_root_fingerprints.contains(&fp) {
                verify::verify_signed_by(&current, &current)?;
                return verify::peer_identity(leaf_pem);
            }

            let issuer = {
                let mut found = None;
                for candidate in &pool {
                    if verify::issuer_matches(&current, candidate)?
                        && verify::fingerprint(candidate)? != fp
                    {
                        found = Some(candidate.clone());
                        break;
                    }
                }
                found.ok_or(PkiError::UntrustedIssuer)?
            };

            verify::verify_signed_by(&current, &issuer)?;
            current = issuer;
        }

        Err(PkiError::UntrustedIssuer)
    }

    /// Picks the preferred signing CA: the newest unrevoked intermediate,
    /// falling back to the newest unrevoked root.
    pub async fn select_signing_ca(&self) -> Result<CertificateRecord, PkiError> {
        let intermediates = self
            .backend
            .list_certificates(Some(CertificateType::IntermediateCa))
            .await?;
        if let Some(ca) = intermediates.into_iter().find(|c| !c.revoked) {
            return Ok(ca);
        }

        let roots = self
            .backend
            .list_certificates(Some(CertificateType::RootCa))
            .await?;
        roots
            .into_iter()
            .find(|c| !c.revoked)
            .ok_or(PkiError::NoRootCa)
    }

    /// Issues a TLS server identity for the core's own listeners.
    ///
    /// The key pair lives only for the process lifetime and is returned to
    /// the caller; nothing but the certificate chain leaves this call.
    pub async fn issue_server_identity(
        &self,
        common_name: &str,
        dns_names: &[String],
        validity_days: u32,
    ) -> Result<ServerIdentity, PkiError> {
        let ca = self.select_signing_ca().await?;
        let (issuer_cert, issuer_key) = self.load_issuer(&ca)?;

        let key_pair = KeyPair::generate()?;

        let now = Utc::now();
        let serial_bytes = generate_serial();
        let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
        let not_after =
            (not_before + Duration::days(i64::from(validity_days))).min(ca.not_after);

        let mut params = CertificateParams::new(dns_names.to_vec())?;
        params.distinguished_name = dn(common_name, "Warden");
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        params.not_before = to_validity_time(not_before)?;
        params.not_after = to_validity_time(not_after)?;

        let certificate = params.signed_by(&key_pair, &issuer_cert, &issuer_key)?;

        let mut chain_pem = String::new();
        if ca.cert_type == CertificateType::IntermediateCa {
            chain_pem.push_str(ca.certificate_pem.trim_end());
            chain_pem.push('\n');
        }

        Ok(ServerIdentity {
            certificate_pem: certificate.pem(),
            private_key_pem: key_pair.serialize_pem(),
            chain_pem,
            ca_chain_pem: self.get_ca_chain().await?,
        })
    }

    /// Fetches one certificate record.
    pub async fn get(&self, id: Uuid) -> Result<CertificateRecord, PkiError> {
        self.backend
            .get_certificate(id)
            .await?
            .ok_or_else(|| PkiError::NotFound(id.to_string()))
    }

    /// Lists certificate records, optionally filtered by type.
    pub async fn list(
        &self,
        cert_type: Option<CertificateType>,
    ) -> Result<Vec<CertificateRecord>, PkiError> {
        Ok(self.backend.list_certificates(cert_type).await?)
    }

    /// Lists unrevoked certificates expiring within `window`.
    pub async fn expiring_within(
        &self,
        window: Duration,
    ) -> Result<Vec<CertificateRecord>, PkiError> {
        Ok(self
            .backend
            .list_certificates_expiring_before(Utc::now() + window)
            .await?)
    }

    async fn check_revocation(&self, pem: &str) -> Result<(), PkiError> {
        let fp = verify::fingerprint(pem)?;
        if let Some(record) = self.backend.get_certificate_by_fingerprint(&fp).await? {
            if record.revoked {
                return Err(PkiError::Revoked(record.serial));
            }
        }
        Ok(())
    }

    /// Rebuilds an issuer certificate object and unwraps its signing key.
    fn load_issuer(&self, ca: &CertificateRecord) -> Result<(Certificate, KeyPair), PkiError> {
        let wrapped = ca
            .encrypted_private_key
            .as_ref()
            .ok_or_else(|| PkiError::CaPrivateKeyUnavailable(ca.serial.clone()))?;

        let key = keygen::unwrap_ca_key(&self.keys, wrapped)?;

        let params = CertificateParams::from_ca_cert_pem(&ca.certificate_pem)
            .map_err(|e| PkiError::Crypto(format!("CA reload failed: {e}")))?;
        let issuer_cert = params.self_signed(&key)?;

        Ok((issuer_cert, key))
    }

    async fn audit_issue(&self, actor: &Actor, record: &CertificateRecord) -> Result<(), PkiError> {
        self.audit
            .append(
                AuditEvent::new(
                    kind::PKI_ISSUE,
                    actor.clone(),
                    format!("pki/{}", record.serial),
                    Outcome::Success,
                )
                .with_meta("cert_type", record.cert_type.as_str())
                .with_meta("subject", record.subject.clone())
                .with_meta("fingerprint", record.fingerprint.clone()),
            )
            .await?;
        Ok(())
    }
}

fn dn(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, organization);
    dn
}

fn to_validity_time(at: DateTime<Utc>) -> Result<OffsetDateTime, PkiError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| PkiError::InvalidInput(format!("timestamp out of range: {e}")))
}

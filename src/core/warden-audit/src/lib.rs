//! # Warden Audit
//!
//! Tamper-evident audit log: append-only, hash-chained, HMAC-signed.
//!
//! Every entry hashes its canonical serialization and links to its
//! predecessor's hash (`"GENESIS"` for the first entry). The signature is
//! HMAC-SHA-256 over the hash, keyed by a subkey derived from the master
//! key, so entries can only be signed while the core is unsealed.
//!
//! Concurrent appenders race on the unique sequence constraint: the loser
//! re-reads the tail and retries up to three times with randomized backoff
//! before surfacing [`AuditError::Contention`], at which point the
//! caller's protected operation is considered failed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod error;
pub mod event;

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use warden_crypto::hash::{constant_time_eq, hmac_sha256_hex, sha256_hex};
use warden_seal::KeyAccess;
use warden_storage::records::AuditEntryRecord;
use warden_storage_sqlite::{AuditSearchFilter, CoupledWrite, SqliteBackend};

pub use error::AuditError;
pub use event::{kind, Actor, AuditEvent, Outcome};

/// Previous-hash marker for the first chain entry.
pub const GENESIS: &str = "GENESIS";

/// HKDF context for the audit signing key.
const AUDIT_HMAC_CONTEXT: &[u8] = b"audit-hmac";

/// Maximum insert attempts before reporting contention.
const MAX_APPEND_ATTEMPTS: u32 = 3;

/// Page size for streaming verification.
const VERIFY_PAGE: i64 = 512;

/// Audit signing key, zeroized on drop.
type SigningKey = Zeroizing<[u8; 32]>;

/// Why a chain failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFault {
    /// Sequence numbers are not the gapless series 1, 2, 3, …
    SequenceGap,
    /// An entry's stored hash does not match its fields.
    HashMismatch,
    /// An entry's HMAC signature does not verify.
    SignatureMismatch,
    /// An entry does not link to its predecessor's hash.
    PreviousHashMismatch,
}

/// Result of a chain verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerification {
    /// Every entry checks out.
    Valid {
        /// Number of entries verified.
        entries: u64,
    },
    /// The chain is broken at `sequence`.
    Invalid {
        /// First failing sequence number.
        sequence: i64,
        /// What failed.
        reason: ChainFault,
    },
}

/// The audit log.
#[derive(Clone)]
pub struct AuditLog {
    backend: SqliteBackend,
    keys: KeyAccess,
    // Set when verification finds the chain broken. Every protected
    // operation appends, so refusing appends refuses further writes
    // platform-wide until a verification pass comes back clean.
    quarantined: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl AuditLog {
    /// Creates the log over storage and the master key capability.
    pub fn new(backend: SqliteBackend, keys: KeyAccess) -> Self {
        Self {
            backend,
            keys,
            quarantined: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Appends an event to the chain.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEntryRecord, AuditError> {
        self.append_coupled(event, CoupledWrite::None).await
    }

    /// Appends an event, committing `coupled` in the same transaction so
    /// the protected state change cannot land without its audit record.
    pub async fn append_coupled(
        &self,
        event: AuditEvent,
        coupled: CoupledWrite,
    ) -> Result<AuditEntryRecord, AuditError> {
        if self.quarantined.load(std::sync::atomic::Ordering::Acquire) {
            return Err(AuditError::ChainInvalid);
        }

        let key = self.signing_key()?;

        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|e| AuditError::Crypto(e.to_string()))?;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let tail = self.backend.audit_tail().await?;
            let (sequence, previous_hash) = match tail {
                Some((seq, hash)) => (seq + 1, hash),
                None => (1, GENESIS.to_string()),
            };

            let entry = seal_entry(&key, sequence, previous_hash, &event, &metadata_json);

            match self.backend.insert_audit_entry(&entry, &coupled).await {
                Ok(()) => {
                    debug!(sequence, kind = %entry.event_kind, "Audit entry appended");
                    return Ok(entry);
                }
                Err(warden_storage::StorageError::Conflict(_)) => {
                    if attempt == MAX_APPEND_ATTEMPTS {
                        warn!(sequence, "Audit append contention, giving up");
                        return Err(AuditError::Contention);
                    }
                    let backoff = rand::thread_rng().gen_range(5..25);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AuditError::Contention)
    }

    /// Streams the whole chain and verifies hashes, links, sequence
    /// continuity and signatures.
    ///
    /// A broken chain quarantines the log: appends fail with
    /// `ChainInvalid` until a later pass over restored data succeeds.
    pub async fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let verification = self.verify_chain_inner().await?;

        let broken = matches!(verification, ChainVerification::Invalid { .. });
        self.quarantined
            .store(broken, std::sync::atomic::Ordering::Release);
        if broken {
            warn!("Audit chain verification failed; refusing further writes");
        }

        Ok(verification)
    }

    async fn verify_chain_inner(&self) -> Result<ChainVerification, AuditError> {
        let key = self.signing_key()?;

        let mut expected_sequence = 1i64;
        let mut previous_hash = GENESIS.to_string();
        let mut verified = 0u64;
        let mut after = 0i64;

        loop {
            let page = self.backend.list_audit_entries(after, VERIFY_PAGE).await?;
            if page.is_empty() {
                break;
            }

            for entry in &page {
                if entry.sequence != expected_sequence {
                    return Ok(ChainVerification::Invalid {
                        sequence: entry.sequence,
                        reason: ChainFault::SequenceGap,
                    });
                }

                let recomputed = sha256_hex(&canonical::canonical_bytes(entry));
                if recomputed != entry.current_hash {
                    return Ok(ChainVerification::Invalid {
                        sequence: entry.sequence,
                        reason: ChainFault::HashMismatch,
                    });
                }

                if entry.previous_hash != previous_hash {
                    return Ok(ChainVerification::Invalid {
                        sequence: entry.sequence,
                        reason: ChainFault::PreviousHashMismatch,
                    });
                }

                let signature = hmac_sha256_hex(&*key, entry.current_hash.as_bytes());
                if !constant_time_eq(signature.as_bytes(), entry.signature.as_bytes()) {
                    return Ok(ChainVerification::Invalid {
                        sequence: entry.sequence,
                        reason: ChainFault::SignatureMismatch,
                    });
                }

                previous_hash = entry.current_hash.clone();
                expected_sequence += 1;
                verified += 1;
            }

            after = page[page.len() - 1].sequence;
        }

        Ok(ChainVerification::Valid { entries: verified })
    }

    /// Read-only filtered export. Never mutates the chain.
    pub async fn export(
        &self,
        filter: &AuditSearchFilter,
    ) -> Result<Vec<AuditEntryRecord>, AuditError> {
        Ok(self.backend.search_audit_entries(filter).await?)
    }

    fn signing_key(&self) -> Result<SigningKey, AuditError> {
        let master = self.keys.master_key().map_err(|_| AuditError::Sealed)?;
        Ok(master.derive_subkey(AUDIT_HMAC_CONTEXT)?)
    }
}

/// Computes hash and signature for a fully specified entry.
fn seal_entry(
    key: &SigningKey,
    sequence: i64,
    previous_hash: String,
    event: &AuditEvent,
    metadata_json: &str,
) -> AuditEntryRecord {
    let mut entry = AuditEntryRecord {
        sequence,
        timestamp: Utc::now().timestamp(),
        event_kind: event.kind.clone(),
        actor_type: event.actor.actor_type.clone(),
        actor_id: event.actor.id.clone(),
        target: event.target.clone(),
        outcome: event.outcome.as_str().to_string(),
        metadata_json: metadata_json.to_string(),
        previous_hash,
        current_hash: String::new(),
        signature: String::new(),
    };

    entry.current_hash = sha256_hex(&canonical::canonical_bytes(&entry));
    entry.signature = hmac_sha256_hex(&**key, entry.current_hash.as_bytes());

    entry
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_seal::{SealConfig, SealManager};

    async fn setup() -> (TempDir, SqliteBackend, AuditLog) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).await.unwrap();

        let mut seal = SealManager::new(backend.clone()).await.unwrap();
        let init = seal
            .initialize(SealConfig {
                shares: 3,
                threshold: 2,
            })
            .await
            .unwrap();
        seal.submit_share(&init.shares[0]).await.unwrap();
        seal.submit_share(&init.shares[1]).await.unwrap();

        let log = AuditLog::new(backend.clone(), seal.key_access());
        (tmp, backend, log)
    }

    fn read_event(n: u64) -> AuditEvent {
        AuditEvent::new(kind::SECRET_READ, Actor::agent("agent-1"), "db/prod", Outcome::Success)
            .with_meta("n", n.to_string())
    }

    #[tokio::test]
    async fn test_append_builds_chain() {
        let (_tmp, _backend, log) = setup().await;

        let e1 = log.append(read_event(1)).await.unwrap();
        let e2 = log.append(read_event(2)).await.unwrap();
        let e3 = log.append(read_event(3)).await.unwrap();

        assert_eq!((e1.sequence, e2.sequence, e3.sequence), (1, 2, 3));
        assert_eq!(e1.previous_hash, GENESIS);
        assert_eq!(e2.previous_hash, e1.current_hash);
        assert_eq!(e3.previous_hash, e2.current_hash);
    }

    #[tokio::test]
    async fn test_verify_valid_chain() {
        let (_tmp, _backend, log) = setup().await;

        for n in 0..5 {
            log.append(read_event(n)).await.unwrap();
        }

        assert_eq!(
            log.verify_chain().await.unwrap(),
            ChainVerification::Valid { entries: 5 }
        );
    }

    #[tokio::test]
    async fn test_verify_empty_chain() {
        let (_tmp, _backend, log) = setup().await;

        assert_eq!(
            log.verify_chain().await.unwrap(),
            ChainVerification::Valid { entries: 0 }
        );
    }

    #[tokio::test]
    async fn test_tampered_hash_detected() {
        let (_tmp, backend, log) = setup().await;

        for n in 0..3 {
            log.append(read_event(n)).await.unwrap();
        }

        // Flip entry 2's stored hash.
        backend
            .execute(
                "UPDATE audit_entries SET current_hash = ? WHERE sequence = 2",
                &["0000000000000000000000000000000000000000000000000000000000000000"],
            )
            .await
            .unwrap();

        let result = log.verify_chain().await.unwrap();
        assert_eq!(
            result,
            ChainVerification::Invalid {
                sequence: 2,
                reason: ChainFault::HashMismatch,
            }
        );
    }

    #[tokio::test]
    async fn test_tampered_field_detected() {
        let (_tmp, backend, log) = setup().await;

        for n in 0..3 {
            log.append(read_event(n)).await.unwrap();
        }

        backend
            .execute(
                "UPDATE audit_entries SET target = ? WHERE sequence = 1",
                &["db/other"],
            )
            .await
            .unwrap();

        let result = log.verify_chain().await.unwrap();
        assert_eq!(
            result,
            ChainVerification::Invalid {
                sequence: 1,
                reason: ChainFault::HashMismatch,
            }
        );
    }

    #[tokio::test]
    async fn test_deleted_entry_is_a_gap() {
        let (_tmp, backend, log) = setup().await;

        for n in 0..3 {
            log.append(read_event(n)).await.unwrap();
        }

        backend
            .execute("DELETE FROM audit_entries WHERE sequence = 2", &[])
            .await
            .unwrap();

        let result = log.verify_chain().await.unwrap();
        assert_eq!(
            result,
            ChainVerification::Invalid {
                sequence: 3,
                reason: ChainFault::SequenceGap,
            }
        );
    }

    #[tokio::test]
    async fn test_forged_signature_detected() {
        let (_tmp, backend, log) = setup().await;

        log.append(read_event(1)).await.unwrap();

        backend
            .execute(
                "UPDATE audit_entries SET signature = ? WHERE sequence = 1",
                &["deadbeef"],
            )
            .await
            .unwrap();

        let result = log.verify_chain().await.unwrap();
        assert_eq!(
            result,
            ChainVerification::Invalid {
                sequence: 1,
                reason: ChainFault::SignatureMismatch,
            }
        );
    }

    #[tokio::test]
    async fn test_broken_chain_quarantines_appends() {
        let (_tmp, backend, log) = setup().await;

        log.append(read_event(1)).await.unwrap();
        log.append(read_event(2)).await.unwrap();

        backend
            .execute(
                "UPDATE audit_entries SET target = ? WHERE sequence = 1",
                &["tampered"],
            )
            .await
            .unwrap();

        assert!(matches!(
            log.verify_chain().await.unwrap(),
            ChainVerification::Invalid { .. }
        ));

        // The log now refuses writes until the chain verifies again.
        let result = log.append(read_event(3)).await;
        assert!(matches!(result, Err(AuditError::ChainInvalid)));

        // Restoring the row and re-verifying lifts the quarantine.
        backend
            .execute(
                "UPDATE audit_entries SET target = ? WHERE sequence = 1",
                &["db/prod"],
            )
            .await
            .unwrap();
        assert!(matches!(
            log.verify_chain().await.unwrap(),
            ChainVerification::Valid { .. }
        ));
        log.append(read_event(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sealed_append_fails() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).await.unwrap();

        let seal = SealManager::new(backend.clone()).await.unwrap();
        let log = AuditLog::new(backend, seal.key_access());

        let result = log.append(read_event(1)).await;
        assert!(matches!(result, Err(AuditError::Sealed)));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gapless() {
        let (_tmp, _backend, log) = setup().await;

        let mut handles = Vec::new();
        for n in 0..8u64 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(read_event(n)).await
            }));
        }

        let mut sequences = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(entry) => sequences.push(entry.sequence),
                // Contention after retries is an accepted outcome for the
                // caller, but the chain itself must stay gapless.
                Err(AuditError::Contention) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        sequences.sort_unstable();
        for (i, seq) in sequences.iter().enumerate() {
            assert_eq!(*seq, (i + 1) as i64);
        }

        assert!(matches!(
            log.verify_chain().await.unwrap(),
            ChainVerification::Valid { .. }
        ));
    }

    #[tokio::test]
    async fn test_export_filters() {
        let (_tmp, _backend, log) = setup().await;

        log.append(read_event(1)).await.unwrap();
        log.append(AuditEvent::new(
            kind::AUTH_LOGIN,
            Actor::app("app-1"),
            "role:db",
            Outcome::Denied,
        ))
        .await
        .unwrap();

        let found = log
            .export(&AuditSearchFilter {
                event_kind: Some(kind::AUTH_LOGIN.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].outcome, "denied");
    }
}

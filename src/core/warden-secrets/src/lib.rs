//! # Warden Secrets
//!
//! Versioned encrypted secrets with policy binding.
//!
//! Payloads are AES-256-GCM blobs under a subkey derived from the master
//! key, one fresh nonce per write, each bound to its storage path through
//! the AEAD associated data. Every read is policy-gated; denials are
//! audited with `outcome = denied` and payloads never appear in audit
//! records. Deletion tombstones the path; versions stay retrievable for
//! the retention window, then a housekeeping purge removes them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use zeroize::Zeroizing;

use warden_audit::{kind, Actor, AuditEvent, AuditLog, Outcome};
use warden_crypto::aead;
use warden_policy::{Capability, Decision, PolicyStore, Principal, RequestContext};
use warden_seal::KeyAccess;
use warden_storage::records::SecretType;
use warden_storage_sqlite::{CoupledWrite, SqliteBackend};

pub use error::SecretsError;

/// HKDF context for the secrets encryption key.
const SECRETS_CONTEXT: &[u8] = b"secrets-engine";

/// A decrypted secret returned to a caller.
#[derive(Debug, Clone)]
pub struct SecretData {
    /// Secret path.
    pub path: String,
    /// Version returned.
    pub version: i64,
    /// Decrypted payload.
    pub data: serde_json::Value,
    /// When this version was written.
    pub created_at: DateTime<Utc>,
}

/// Version metadata without payload.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Version number.
    pub version: i64,
    /// When the version was written.
    pub created_at: DateTime<Utc>,
}

/// The secrets engine.
#[derive(Clone)]
pub struct SecretsEngine {
    backend: SqliteBackend,
    keys: KeyAccess,
    policies: Arc<PolicyStore>,
    audit: Arc<AuditLog>,
}

impl SecretsEngine {
    /// Creates the engine.
    pub fn new(
        backend: SqliteBackend,
        keys: KeyAccess,
        policies: Arc<PolicyStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            backend,
            keys,
            policies,
            audit,
        }
    }

    /// Writes a new version at `path`. Returns the version number.
    pub async fn write(
        &self,
        path: &str,
        data: &serde_json::Value,
        secret_type: SecretType,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<i64, SecretsError> {
        validate_path(path)?;
        self.authorize(principal, path, Capability::Write, ctx, kind::SECRET_WRITE)
            .await?;

        if !data.is_object() {
            return Err(SecretsError::InvalidPayload(
                "secret payload must be a JSON object".into(),
            ));
        }

        let plaintext = serde_json::to_vec(data)
            .map_err(|e| SecretsError::InvalidPayload(e.to_string()))?;

        // The blob is bound to its path: a ciphertext copied onto another
        // row fails authentication on read.
        let key = self.encryption_key()?;
        let ciphertext = aead::encrypt(&*key, path.as_bytes(), &plaintext)?;

        let version = self
            .backend
            .write_secret_version(path, secret_type, &ciphertext, Utc::now())
            .await?;

        self.audit
            .append(
                AuditEvent::new(
                    kind::SECRET_WRITE,
                    actor_of(principal),
                    path,
                    Outcome::Success,
                )
                .with_meta("version", version.to_string()),
            )
            .await?;

        info!(path = %path, version, "Secret written");

        Ok(version)
    }

    /// Reads the current (or a specific) version at `path`.
    pub async fn read(
        &self,
        path: &str,
        version: Option<i64>,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<SecretData, SecretsError> {
        validate_path(path)?;
        self.authorize(principal, path, Capability::Read, ctx, kind::SECRET_READ)
            .await?;

        // Key derivation first: a sealed core refuses reads before
        // touching the record at all.
        let key = self.encryption_key()?;

        let meta = match self.backend.get_secret(path).await? {
            Some(meta) if meta.deleted_at.is_none() => meta,
            _ => {
                self.audit
                    .append(AuditEvent::new(
                        kind::SECRET_READ,
                        actor_of(principal),
                        path,
                        Outcome::Failure,
                    ))
                    .await?;
                return Err(SecretsError::NotFound(path.to_string()));
            }
        };

        let wanted = version.unwrap_or(meta.current_version);
        let stored = self
            .backend
            .get_secret_version(path, wanted)
            .await?
            .ok_or_else(|| SecretsError::VersionNotFound {
                path: path.to_string(),
                version: wanted,
            })?;

        let plaintext = aead::decrypt(&*key, path.as_bytes(), &stored.ciphertext)
            .map_err(|e| SecretsError::Crypto(e.to_string()))?;
        let data: serde_json::Value = serde_json::from_slice(&plaintext)
            .map_err(|e| SecretsError::Crypto(format!("payload corrupt: {e}")))?;

        self.audit
            .append(
                AuditEvent::new(
                    kind::SECRET_READ,
                    actor_of(principal),
                    path,
                    Outcome::Success,
                )
                .with_meta("version", wanted.to_string()),
            )
            .await?;

        debug!(path = %path, version = wanted, "Secret read");

        Ok(SecretData {
            path: path.to_string(),
            version: wanted,
            data,
            created_at: stored.created_at,
        })
    }

    /// Tombstones a secret. The flip and its audit record commit together.
    pub async fn delete(
        &self,
        path: &str,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<(), SecretsError> {
        validate_path(path)?;
        self.authorize(principal, path, Capability::Delete, ctx, kind::SECRET_DELETE)
            .await?;

        let deleted_at = Utc::now();
        let event = AuditEvent::new(
            kind::SECRET_DELETE,
            actor_of(principal),
            path,
            Outcome::Success,
        );

        self.audit
            .append_coupled(
                event,
                CoupledWrite::TombstoneSecret {
                    path: path.to_string(),
                    deleted_at,
                },
            )
            .await
            .map_err(|e| match e {
                warden_audit::AuditError::Storage(msg) if msg.contains("not found") => {
                    SecretsError::NotFound(path.to_string())
                }
                other => other.into(),
            })?;

        info!(path = %path, "Secret deleted");

        Ok(())
    }

    /// Lists the versions stored at a path (metadata only).
    pub async fn list_versions(
        &self,
        path: &str,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<Vec<VersionInfo>, SecretsError> {
        validate_path(path)?;
        self.authorize(principal, path, Capability::Read, ctx, kind::SECRET_READ)
            .await?;

        let versions = self.backend.list_secret_versions(path).await?;
        if versions.is_empty() {
            return Err(SecretsError::NotFound(path.to_string()));
        }

        Ok(versions
            .into_iter()
            .map(|v| VersionInfo {
                version: v.version,
                created_at: v.created_at,
            })
            .collect())
    }

    /// Lists live secret paths under a prefix.
    pub async fn list_paths(&self, prefix: &str) -> Result<Vec<String>, SecretsError> {
        Ok(self.backend.list_secret_paths(prefix).await?)
    }

    /// Replaces the policy bindings on a secret (admin surface).
    pub async fn set_policies(
        &self,
        path: &str,
        policies: &[String],
    ) -> Result<(), SecretsError> {
        validate_path(path)?;
        if !self
            .backend
            .set_secret_policies(path, policies, Utc::now())
            .await?
        {
            return Err(SecretsError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Purges tombstoned secrets past the retention window. Returns the
    /// number purged.
    pub async fn purge_tombstones(&self, retention: Duration) -> Result<u64, SecretsError> {
        let cutoff = Utc::now() - retention;
        let purged = self.backend.purge_deleted_secrets(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged tombstoned secrets past retention");
        }
        Ok(purged)
    }

    /// Policy gate shared by every operation. Denials are audited before
    /// the error returns.
    async fn authorize(
        &self,
        principal: &Principal,
        path: &str,
        capability: Capability,
        ctx: &RequestContext,
        event_kind: &str,
    ) -> Result<(), SecretsError> {
        if principal.admin {
            return Ok(());
        }

        match self
            .policies
            .evaluate(&principal.policies, path, capability, ctx)
        {
            Decision::Allow { .. } => Ok(()),
            Decision::Deny { policy, .. } => {
                self.audit
                    .append(AuditEvent::new(
                        event_kind,
                        actor_of(principal),
                        path,
                        Outcome::Denied,
                    ))
                    .await?;
                Err(SecretsError::AccessDenied { policy })
            }
        }
    }

    fn encryption_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretsError> {
        let master = self.keys.master_key().map_err(|_| SecretsError::Sealed)?;
        Ok(master.derive_subkey(SECRETS_CONTEXT)?)
    }
}

fn actor_of(principal: &Principal) -> Actor {
    Actor {
        actor_type: principal.actor_type.clone(),
        id: principal.entity_id.clone(),
    }
}

/// Paths are slash-separated, non-empty segments of
/// `[a-zA-Z0-9_.-]`, with no leading or trailing slash.
fn validate_path(path: &str) -> Result<(), SecretsError> {
    if path.is_empty() || path.len() > 512 {
        return Err(SecretsError::InvalidPath("empty or oversized path".into()));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(SecretsError::InvalidPath(
            "path cannot start or end with '/'".into(),
        ));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(SecretsError::InvalidPath(format!(
                "bad path segment {segment:?}"
            )));
        }
        let ok = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !ok {
            return Err(SecretsError::InvalidPath(format!(
                "bad characters in segment {segment:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use warden_policy::{Policy, PolicyEffect, PolicyRule};
    use warden_seal::{SealConfig, SealManager};

    struct Fixture {
        _tmp: TempDir,
        backend: SqliteBackend,
        seal: SealManager,
        policies: Arc<PolicyStore>,
        engine: SecretsEngine,
    }

    async fn setup() -> Fixture {
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

        let policies = Arc::new(PolicyStore::open(backend.clone()).await.unwrap());
        let audit = Arc::new(AuditLog::new(backend.clone(), seal.key_access()));
        let engine = SecretsEngine::new(
            backend.clone(),
            seal.key_access(),
            policies.clone(),
            audit,
        );

        Fixture {
            _tmp: tmp,
            backend,
            seal,
            policies,
            engine,
        }
    }

    fn rule(path: &str, caps: &[Capability]) -> PolicyRule {
        PolicyRule {
            path: path.to_string(),
            capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
            conditions: Default::default(),
        }
    }

    async fn allow_policy(fixture: &Fixture, name: &str, path: &str, caps: &[Capability]) {
        fixture
            .policies
            .set_policy(Policy {
                name: name.to_string(),
                effect: PolicyEffect::Allow,
                rules: vec![rule(path, caps)],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        let payload = json!({"user": "u", "pass": "p"});
        let version = fixture
            .engine
            .write("db/prod", &payload, SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let secret = fixture
            .engine
            .read("db/prod", None, &admin, &ctx)
            .await
            .unwrap();
        assert_eq!(secret.data, payload);
        assert_eq!(secret.version, 1);
    }

    #[tokio::test]
    async fn test_versions_and_specific_read() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        fixture
            .engine
            .write("app/key", &json!({"v": 1}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        fixture
            .engine
            .write("app/key", &json!({"v": 2}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();

        let old = fixture
            .engine
            .read("app/key", Some(1), &admin, &ctx)
            .await
            .unwrap();
        assert_eq!(old.data, json!({"v": 1}));

        let current = fixture.engine.read("app/key", None, &admin, &ctx).await.unwrap();
        assert_eq!(current.version, 2);

        let versions = fixture
            .engine
            .list_versions("app/key", &admin, &ctx)
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);

        let result = fixture.engine.read("app/key", Some(9), &admin, &ctx).await;
        assert!(matches!(
            result,
            Err(SecretsError::VersionNotFound { version: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_policy_gating_and_denied_audit() {
        let fixture = setup().await;
        let ctx = RequestContext::now();

        allow_policy(&fixture, "dev_read", "dev/**", &[Capability::Read]).await;

        let admin = Principal::admin("root");
        fixture
            .engine
            .write("dev/db", &json!({"k": "v"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        fixture
            .engine
            .write("prod/db", &json!({"k": "v"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();

        let agent = Principal::agent("role:dev", vec!["dev_read".to_string()]);

        let ok = fixture.engine.read("dev/db", None, &agent, &ctx).await;
        assert!(ok.is_ok());

        let denied = fixture.engine.read("prod/db", None, &agent, &ctx).await;
        assert!(matches!(denied, Err(SecretsError::AccessDenied { .. })));

        // The denial shows up in the audit trail, payload-free.
        let entries = fixture
            .backend
            .search_audit_entries(&warden_storage_sqlite::AuditSearchFilter {
                event_kind: Some(kind::SECRET_READ.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(entries.iter().any(|e| e.outcome == "denied"));
        assert!(entries.iter().all(|e| !e.metadata_json.contains("\"v\"")));
    }

    #[tokio::test]
    async fn test_blob_swapped_between_paths_fails() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        fixture
            .engine
            .write("db/prod", &json!({"env": "prod"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        fixture
            .engine
            .write("db/dev", &json!({"env": "dev"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();

        // Copy prod's ciphertext onto the dev row. The path binding makes
        // the transplanted blob fail authentication.
        fixture
            .backend
            .execute_raw(
                "UPDATE secret_versions SET ciphertext = \
                 (SELECT ciphertext FROM secret_versions WHERE path = 'db/prod' AND version = 1) \
                 WHERE path = 'db/dev' AND version = 1",
            )
            .await
            .unwrap();

        let result = fixture.engine.read("db/dev", None, &admin, &ctx).await;
        assert!(matches!(result, Err(SecretsError::Crypto(_))));

        // The original row still reads fine.
        fixture.engine.read("db/prod", None, &admin, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_sealed_read_fails() {
        let mut fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        fixture
            .engine
            .write("db/prod", &json!({"k": "v"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();

        fixture.seal.seal().unwrap();

        let result = fixture.engine.read("db/prod", None, &admin, &ctx).await;
        assert!(matches!(result, Err(SecretsError::Sealed)));
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        fixture
            .engine
            .write("db/prod", &json!({"k": "v"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();

        fixture.engine.delete("db/prod", &admin, &ctx).await.unwrap();

        let result = fixture.engine.read("db/prod", None, &admin, &ctx).await;
        assert!(matches!(result, Err(SecretsError::NotFound(_))));

        let result = fixture.engine.delete("db/prod", &admin, &ctx).await;
        assert!(matches!(result, Err(SecretsError::NotFound(_))));

        // Rewrite revives the path at the next version.
        let version = fixture
            .engine
            .write("db/prod", &json!({"k": "v2"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        fixture
            .engine
            .write("old/one", &json!({"k": "v"}), SecretType::Static, &admin, &ctx)
            .await
            .unwrap();
        fixture.engine.delete("old/one", &admin, &ctx).await.unwrap();

        // Fresh tombstone survives a 90-day retention purge.
        let purged = fixture
            .engine
            .purge_tombstones(Duration::days(90))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        // Zero retention purges immediately.
        let purged = fixture
            .engine
            .purge_tombstones(Duration::days(0))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_path_validation() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        for bad in ["", "/lead", "trail/", "a//b", "bad segment", "a/b/../c"] {
            let result = fixture
                .engine
                .write(bad, &json!({}), SecretType::Static, &admin, &ctx)
                .await;
            assert!(
                matches!(result, Err(SecretsError::InvalidPath(_))),
                "path {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let fixture = setup().await;
        let admin = Principal::admin("root");
        let ctx = RequestContext::now();

        let result = fixture
            .engine
            .write("db/prod", &json!("scalar"), SecretType::Static, &admin, &ctx)
            .await;
        assert!(matches!(result, Err(SecretsError::InvalidPayload(_))));
    }
}

//! Audit event construction.

use std::collections::BTreeMap;

/// Who performed an audited operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Actor kind: `agent`, `app`, `admin` or `system`.
    pub actor_type: String,
    /// Actor identifier. Never a secret value.
    pub id: String,
}

impl Actor {
    /// An agent process actor.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            actor_type: "agent".to_string(),
            id: id.into(),
        }
    }

    /// An application actor.
    pub fn app(id: impl Into<String>) -> Self {
        Self {
            actor_type: "app".to_string(),
            id: id.into(),
        }
    }

    /// An administrator actor.
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            actor_type: "admin".to_string(),
            id: id.into(),
        }
    }

    /// The core itself (sweeper, startup, shutdown).
    pub fn system(id: impl Into<String>) -> Self {
        Self {
            actor_type: "system".to_string(),
            id: id.into(),
        }
    }
}

/// Operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// Policy evaluation refused the operation.
    Denied,
    /// The operation failed.
    Failure,
}

impl Outcome {
    /// Stable string form used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Failure => "failure",
        }
    }
}

/// Well-known event kinds.
pub mod kind {
    /// Seal initialization.
    pub const SEAL_INIT: &str = "seal.init";
    /// Transition to unsealed.
    pub const SEAL_UNSEAL: &str = "seal.unseal";
    /// Transition to sealed.
    pub const SEAL_SEAL: &str = "seal.seal";
    /// Authentication attempt.
    pub const AUTH_LOGIN: &str = "auth.login";
    /// Secret id minted.
    pub const AUTH_SECRET_ID_MINT: &str = "auth.secret_id_mint";
    /// Role created.
    pub const AUTH_ROLE_CREATE: &str = "auth.role_create";
    /// Role deleted.
    pub const AUTH_ROLE_DELETE: &str = "auth.role_delete";
    /// Secret read.
    pub const SECRET_READ: &str = "secret.read";
    /// Secret written.
    pub const SECRET_WRITE: &str = "secret.write";
    /// Secret tombstoned.
    pub const SECRET_DELETE: &str = "secret.delete";
    /// Policy created or updated.
    pub const POLICY_WRITE: &str = "policy.write";
    /// Policy deleted.
    pub const POLICY_DELETE: &str = "policy.delete";
    /// Certificate issued.
    pub const PKI_ISSUE: &str = "pki.issue";
    /// Certificate revoked.
    pub const PKI_REVOKE: &str = "pki.revoke";
    /// Dynamic credential issued.
    pub const LEASE_ISSUE: &str = "lease.issue";
    /// Lease renewed.
    pub const LEASE_RENEW: &str = "lease.renew";
    /// Lease revoked.
    pub const LEASE_REVOKE: &str = "lease.revoke";
    /// Backend revocation gave up; lease marked revoked locally.
    pub const LEASE_REVOCATION_FAILED: &str = "lease.revocation_failed";
    /// Agent session opened.
    pub const SESSION_OPEN: &str = "session.open";
    /// Agent session closed.
    pub const SESSION_CLOSE: &str = "session.close";
}

/// An event to append to the chain. Sequence, hashes and signature are
/// assigned by the log at append time.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event kind, e.g. [`kind::SECRET_READ`].
    pub kind: String,
    /// Acting principal.
    pub actor: Actor,
    /// Target path or entity reference.
    pub target: String,
    /// Outcome.
    pub outcome: Outcome,
    /// Structured metadata. Sorted map so the serialized form is canonical.
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Creates an event with empty metadata.
    pub fn new(
        kind: impl Into<String>,
        actor: Actor,
        target: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            kind: kind.into(),
            actor,
            target: target.into(),
            outcome,
            metadata: BTreeMap::new(),
        }
    }

    /// Attaches a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let event = AuditEvent::new(kind::SECRET_READ, Actor::agent("a-1"), "db/prod", Outcome::Success)
            .with_meta("version", "3");

        assert_eq!(event.kind, "secret.read");
        assert_eq!(event.actor.actor_type, "agent");
        assert_eq!(event.metadata.get("version").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_metadata_sorted() {
        let event = AuditEvent::new(kind::SECRET_READ, Actor::system("core"), "x", Outcome::Success)
            .with_meta("zebra", "1")
            .with_meta("alpha", "2");

        let json = serde_json::to_string(&event.metadata).unwrap();
        assert!(json.find("alpha").unwrap() < json.find("zebra").unwrap());
    }
}

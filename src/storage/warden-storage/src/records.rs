//! Persistent record types.
//!
//! Every entity the core owns is stored through one of these records. The
//! structs are plain data: engines hold loaded copies, the storage backend
//! owns the durable rows. Timestamps are UTC with second precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of certificate in the internal PKI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    /// Self-signed root CA.
    RootCa,
    /// Intermediate CA signed by the root.
    IntermediateCa,
    /// Client certificate for an agent process.
    AgentClient,
    /// Client certificate for an application.
    AppClient,
    /// Client certificate for an administrator.
    AdminClient,
}

impl CertificateType {
    /// Stable string form used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootCa => "root_ca",
            Self::IntermediateCa => "intermediate_ca",
            Self::AgentClient => "agent_client",
            Self::AppClient => "app_client",
            Self::AdminClient => "admin_client",
        }
    }

    /// Parses the storage column form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root_ca" => Some(Self::RootCa),
            "intermediate_ca" => Some(Self::IntermediateCa),
            "agent_client" => Some(Self::AgentClient),
            "app_client" => Some(Self::AppClient),
            "admin_client" => Some(Self::AdminClient),
            _ => None,
        }
    }

    /// True for CA certificates (root or intermediate).
    pub fn is_ca(&self) -> bool {
        matches!(self, Self::RootCa | Self::IntermediateCa)
    }
}

/// A stored certificate. Never deleted; revocation flips the flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Primary key.
    pub id: Uuid,
    /// X.509 serial number, lowercase hex. Unique.
    pub serial: String,
    /// Certificate kind.
    pub cert_type: CertificateType,
    /// PEM-encoded certificate.
    pub certificate_pem: String,
    /// AEAD-wrapped DER private key. Present for CA certificates only.
    pub encrypted_private_key: Option<Vec<u8>>,
    /// SHA-256 fingerprint of the DER certificate, lowercase hex.
    pub fingerprint: String,
    /// Subject common name.
    pub subject: String,
    /// Issuer common name.
    pub issuer: String,
    /// Record id of the issuing CA, if issued internally.
    pub issuer_id: Option<Uuid>,
    /// Validity start.
    pub not_before: DateTime<Utc>,
    /// Validity end.
    pub not_after: DateTime<Utc>,
    /// Revocation flag.
    pub revoked: bool,
    /// When the certificate was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Operator-supplied revocation reason.
    pub revocation_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An AppRole definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Unique role name.
    pub name: String,
    /// Public role identifier, generated at creation and immutable.
    pub role_id: Uuid,
    /// Policy names bound to entities logging in through this role.
    pub policies: Vec<String>,
    /// Whether login requires a valid secret id.
    pub bind_secret_id: bool,
    /// Lifetime of minted secret ids, seconds. `None` means no expiry.
    pub secret_id_ttl: Option<i64>,
    /// Number of logins a minted secret id permits. `None` means unlimited.
    pub secret_id_num_uses: Option<i64>,
    /// Lifetime of session tokens issued on login, seconds.
    pub token_ttl: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A minted secret id, persisted only as a salted hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretIdRecord {
    /// Primary key.
    pub id: Uuid,
    /// Owning role.
    pub role_name: String,
    /// Argon2id hash of the secret id (PHC string).
    pub secret_id_hash: String,
    /// Remaining logins. `None` means unlimited.
    pub uses_remaining: Option<i64>,
    /// Expiry instant. `None` means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation flag (exhaustion or explicit destroy).
    pub revoked: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A session token. The bearer value itself is never stored; the row is
/// keyed by its SHA-256 hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// SHA-256 of the bearer value, lowercase hex. Unique.
    pub token_hash: String,
    /// Entity the token authenticates (role id for AppRole logins).
    pub entity_id: String,
    /// Role the token was issued through, if any.
    pub role_name: Option<String>,
    /// Secret id consumed at login, if any.
    pub secret_id_ref: Option<Uuid>,
    /// Policy names snapshotted at issuance.
    pub policies: Vec<String>,
    /// Certificate fingerprint the token is bound to, if any.
    pub bound_cert_fingerprint: Option<String>,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Revocation flag.
    pub revoked: bool,
}

/// A stored policy document. The rule set is kept serialized; the policy
/// engine owns the typed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// Unique policy name.
    pub name: String,
    /// `"allow"` or `"deny"`.
    pub effect: String,
    /// JSON-serialized rule list.
    pub rules_json: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Kind of secret stored at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// Plain versioned key/value secret.
    Static,
    /// Configuration template for a dynamic backend.
    DynamicConfig,
}

impl SecretType {
    /// Stable string form used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::DynamicConfig => "dynamic_config",
        }
    }

    /// Parses the storage column form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(Self::Static),
            "dynamic_config" => Some(Self::DynamicConfig),
            _ => None,
        }
    }
}

/// Secret metadata. Payloads live in [`SecretVersionRecord`] rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Unique secret path.
    pub path: String,
    /// Secret kind.
    pub secret_type: SecretType,
    /// Highest written version.
    pub current_version: i64,
    /// Policy names bound to the secret.
    pub policies: Vec<String>,
    /// Tombstone instant. Reads return not-found once set.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// One immutable encrypted secret version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersionRecord {
    /// Owning secret path.
    pub path: String,
    /// Version number, 1-based.
    pub version: i64,
    /// AEAD blob: `nonce || ciphertext || tag`.
    pub ciphertext: Vec<u8>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One appended audit entry. Rows are append-only and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryRecord {
    /// Strictly monotonic, gapless sequence starting at 1.
    pub sequence: i64,
    /// Event instant, Unix seconds.
    pub timestamp: i64,
    /// Event kind, e.g. `secret.read` or `auth.login`.
    pub event_kind: String,
    /// Actor kind: `agent`, `app`, `admin`, `system`.
    pub actor_type: String,
    /// Actor identifier.
    pub actor_id: String,
    /// Target path or entity reference. Never a secret value.
    pub target: String,
    /// Outcome: `success`, `denied`, `failure`.
    pub outcome: String,
    /// JSON metadata map (sorted keys).
    pub metadata_json: String,
    /// `current_hash` of the previous entry, or `"GENESIS"` at sequence 1.
    pub previous_hash: String,
    /// SHA-256 over the canonical serialization, lowercase hex.
    pub current_hash: String,
    /// HMAC-SHA-256 over `current_hash`, lowercase hex.
    pub signature: String,
}

/// A dynamic-credential lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Primary key.
    pub lease_id: Uuid,
    /// Entity that requested the credential.
    pub entity_id: String,
    /// Backend kind, e.g. `postgres` or `ephemeral`.
    pub backend_kind: String,
    /// Opaque backend credential handle.
    pub backend_handle: String,
    /// Secret path the lease was issued under (policy anchor for renew).
    pub path: String,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Current expiry. Always ≤ `issued_at + max_ttl_seconds`.
    pub expires_at: DateTime<Utc>,
    /// Hard lifetime cap, seconds from issuance.
    pub max_ttl_seconds: i64,
    /// Set while the sweeper or a caller is revoking at the backend.
    pub revoking: bool,
    /// Terminal revocation flag.
    pub revoked: bool,
    /// When the lease was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of an agent binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Bootstrap started, no certificate issued yet.
    Pending,
    /// Certificate issued, agent may connect.
    Active,
    /// Temporarily blocked by an operator.
    Suspended,
    /// Permanently revoked.
    Revoked,
}

impl AgentStatus {
    /// Stable string form used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
        }
    }

    /// Parses the storage column form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Binding between an agent identity, its role and its client certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBindingRecord {
    /// Agent identifier (stable across reconnects).
    pub agent_id: String,
    /// Role the agent bootstrapped through.
    pub role_name: String,
    /// Current client certificate record.
    pub certificate_id: Option<Uuid>,
    /// Last message instant on any session.
    pub last_seen: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

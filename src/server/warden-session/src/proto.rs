//! Wire protocol: length-delimited CBOR frames.
//!
//! Every frame is `{version, kind, correlation, body}`. Responses carry
//! the correlation of their request and may arrive in any order; the
//! caller matches them up. Notifications use correlation 0 and expect no
//! reply. Minor protocol versions add kinds; this is version 1.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame kinds. Requests are < 0x0100, responses 0x01xx, notifications 0x02xx.
pub mod kinds {
    /// AppRole login (bootstrap channel only).
    pub const AUTH_LOGIN: u16 = 0x0001;
    /// CSR submission (bootstrap or renewal).
    pub const CERT_REQUEST: u16 = 0x0002;
    /// Read a secret.
    pub const SECRET_READ: u16 = 0x0010;
    /// Issue a dynamic credential.
    pub const SECRET_DYNAMIC_ISSUE: u16 = 0x0011;
    /// Renew a lease.
    pub const LEASE_RENEW: u16 = 0x0012;
    /// Revoke a lease.
    pub const LEASE_REVOKE: u16 = 0x0013;
    /// Liveness probe.
    pub const HEARTBEAT: u16 = 0x0014;

    /// Successful response; body is the request-specific payload.
    pub const RESPONSE: u16 = 0x0100;
    /// Error response; body is [`super::WireError`].
    pub const ERROR: u16 = 0x0101;

    /// A secret at a watched path was rotated.
    pub const NOTIFY_SECRET_ROTATED: u16 = 0x0200;
    /// A policy changed; cached decisions may be stale.
    pub const NOTIFY_POLICY_UPDATED: u16 = 0x0201;
    /// The agent's certificate approaches expiry.
    pub const NOTIFY_CERT_EXPIRING: u16 = 0x0202;
    /// A lease owned by this entity was revoked.
    pub const NOTIFY_LEASE_REVOKED: u16 = 0x0203;
}

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version; mismatched major versions are rejected.
    pub version: u8,
    /// Frame kind, see [`kinds`].
    pub kind: u16,
    /// Correlation reference; 0 for notifications.
    pub correlation: u64,
    /// Kind-specific payload.
    pub body: Value,
}

impl Frame {
    /// Builds a frame from a serializable body.
    pub fn new<T: Serialize>(kind: u16, correlation: u64, body: &T) -> Result<Self, SessionError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind,
            correlation,
            body: Value::serialized(body)
                .map_err(|e| SessionError::Protocol(format!("encode body: {e}")))?,
        })
    }

    /// Encodes the frame to CBOR bytes (to be length-framed by the codec).
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::with_capacity(128);
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| SessionError::Protocol(format!("encode frame: {e}")))?;
        Ok(buf)
    }

    /// Decodes a frame from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        let frame: Frame = ciborium::de::from_reader(bytes)
            .map_err(|e| SessionError::Protocol(format!("decode frame: {e}")))?;

        if frame.version != PROTOCOL_VERSION {
            return Err(SessionError::Protocol(format!(
                "unsupported protocol version {}",
                frame.version
            )));
        }

        Ok(frame)
    }

    /// Deserializes the body into a typed payload.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, SessionError> {
        self.body
            .deserialized()
            .map_err(|e| SessionError::Protocol(format!("decode body: {e}")))
    }
}

/// Error payload on [`kinds::ERROR`] frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message. Generic for authorization failures.
    pub message: String,
}

/// Stable wire error codes.
pub mod codes {
    /// Core is sealed.
    pub const SEALED: &str = "sealed";
    /// Policy refused the operation.
    pub const ACCESS_DENIED: &str = "access_denied";
    /// Target does not exist.
    pub const NOT_FOUND: &str = "not_found";
    /// Login failed.
    pub const INVALID_CREDENTIALS: &str = "invalid_credentials";
    /// Credential or lease expired.
    pub const EXPIRED: &str = "expired";
    /// Credential, certificate or lease revoked.
    pub const REVOKED: &str = "revoked";
    /// Malformed request.
    pub const INVALID: &str = "invalid";
    /// Request deadline elapsed.
    pub const TIMEOUT: &str = "timeout";
    /// Anything else.
    pub const INTERNAL: &str = "internal";
}

// ---------------------------------------------------------------------------
// Request/response payloads
// ---------------------------------------------------------------------------

/// `auth.login` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Public role id.
    pub role_id: String,
    /// Secret id, when the role requires one.
    pub secret_id: Option<String>,
}

/// `auth.login` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Bearer session token.
    pub token: String,
    /// Policy snapshot.
    pub policies: Vec<String>,
    /// Token expiry, Unix seconds.
    pub expires_at: i64,
}

/// `cert.request` request. On the bootstrap channel `token` must be a
/// valid session token; on an established session it is empty and the
/// session identity applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRequest {
    /// Session token (bootstrap channel).
    #[serde(default)]
    pub token: String,
    /// Stable agent identifier.
    pub agent_id: String,
    /// PEM certificate signing request.
    pub csr_pem: String,
}

/// `cert.request` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertResponse {
    /// Signed client certificate, PEM.
    pub certificate_pem: String,
    /// CA chain (intermediates then root), PEM.
    pub ca_chain_pem: String,
    /// Certificate expiry, Unix seconds.
    pub expires_at: i64,
}

/// `secret.read` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretReadRequest {
    /// Secret path.
    pub path: String,
    /// Specific version; current when absent.
    pub version: Option<i64>,
}

/// `secret.read` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretReadResponse {
    /// Secret path.
    pub path: String,
    /// Version returned.
    pub version: i64,
    /// Decrypted payload.
    pub data: serde_json::Value,
}

/// `secret.dynamic_issue` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicIssueRequest {
    /// Dynamic role name.
    pub role: String,
    /// Requested TTL in seconds.
    pub ttl_seconds: Option<u64>,
}

/// `secret.dynamic_issue` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicIssueResponse {
    /// Lease id for renew/revoke.
    pub lease_id: String,
    /// Credential material.
    pub credentials: serde_json::Value,
    /// Lease expiry, Unix seconds.
    pub expires_at: i64,
}

/// `lease.renew` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewRequest {
    /// Lease id.
    pub lease_id: String,
    /// Requested extension in seconds.
    pub increment_seconds: u64,
}

/// `lease.renew` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewResponse {
    /// New expiry, Unix seconds.
    pub expires_at: i64,
}

/// `lease.revoke` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRevokeRequest {
    /// Lease id.
    pub lease_id: String,
}

/// Empty acknowledgement body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {}

// ---------------------------------------------------------------------------
// Notification payloads
// ---------------------------------------------------------------------------

/// `secret.rotated` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRotatedNotice {
    /// Rotated path.
    pub path: String,
    /// New current version.
    pub new_version: i64,
}

/// `policy.updated` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyUpdatedNotice {
    /// Changed policy.
    pub policy_name: String,
}

/// `cert.expiring` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertExpiringNotice {
    /// Certificate record id.
    pub cert_id: String,
    /// Expiry, Unix seconds.
    pub expires_at: i64,
}

/// `lease.revoked` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRevokedNotice {
    /// Lease id.
    pub lease_id: String,
    /// `requested` or `expired`.
    pub reason: String,
}

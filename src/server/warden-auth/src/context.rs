//! Authentication context types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Method used to authenticate the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// AppRole session token.
    AppRole,
    /// Root token (operator).
    RootToken,
    /// Client certificate on an established mTLS session.
    Certificate,
}

/// Authenticated entity context.
///
/// Passed to handlers after successful authentication; carries the policy
/// snapshot taken when the credential was issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Entity identifier (e.g. `role:db-agent` or `root`).
    pub entity_id: String,

    /// Role the entity authenticated through, when applicable.
    pub role_name: Option<String>,

    /// Policy names in effect for this credential.
    pub policies: Vec<String>,

    /// Authentication method used.
    pub auth_method: AuthMethod,

    /// Credential expiry, when the method has one.
    pub expires_at: Option<DateTime<Utc>>,

    /// Certificate fingerprint the credential is bound to, if any.
    pub bound_cert_fingerprint: Option<String>,
}

/// Name of the built-in policy granting every capability.
pub const ROOT_POLICY: &str = "root";

impl AuthContext {
    /// Creates the root operator context.
    pub fn root() -> Self {
        Self {
            entity_id: "root".to_string(),
            role_name: None,
            policies: vec![ROOT_POLICY.to_string()],
            auth_method: AuthMethod::RootToken,
            expires_at: None,
            bound_cert_fingerprint: None,
        }
    }

    /// Whether this context carries admin capability.
    pub fn is_admin(&self) -> bool {
        self.auth_method == AuthMethod::RootToken
            || self.policies.iter().any(|p| p == ROOT_POLICY)
    }
}

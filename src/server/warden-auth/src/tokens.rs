//! Opaque session tokens.
//!
//! A token is 32 random bytes, shown once base64-encoded with a `wt_`
//! prefix. Storage keeps only the SHA-256 of the bearer string, the policy
//! snapshot, and the lifecycle fields, so a database leak does not leak
//! usable credentials.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use warden_crypto::hash::sha256_hex;
use warden_crypto::random::generate_bytes;
use warden_storage::records::TokenRecord;
use warden_storage_sqlite::SqliteBackend;

use crate::context::{AuthContext, AuthMethod};
use crate::error::AuthError;

/// Display prefix on bearer tokens.
const TOKEN_PREFIX: &str = "wt_";

/// Session token issuance and validation.
#[derive(Clone)]
pub struct TokenStore {
    backend: SqliteBackend,
}

impl TokenStore {
    /// Creates the store.
    pub fn new(backend: SqliteBackend) -> Self {
        Self { backend }
    }

    /// Issues a token for an entity. Returns the bearer string (shown
    /// exactly once) and the stored record.
    pub async fn issue(
        &self,
        entity_id: &str,
        role_name: Option<&str>,
        secret_id_ref: Option<Uuid>,
        policies: &[String],
        ttl_seconds: i64,
        bound_cert_fingerprint: Option<&str>,
    ) -> Result<(String, TokenRecord), AuthError> {
        let bearer = format!("{TOKEN_PREFIX}{}", BASE64.encode(generate_bytes(32)));
        let now = Utc::now();

        let record = TokenRecord {
            token_hash: sha256_hex(bearer.as_bytes()),
            entity_id: entity_id.to_string(),
            role_name: role_name.map(str::to_string),
            secret_id_ref,
            policies: policies.to_vec(),
            bound_cert_fingerprint: bound_cert_fingerprint.map(str::to_string),
            issued_at: now,
            // A zero TTL yields a token that is already expired.
            expires_at: now + Duration::seconds(ttl_seconds.max(0)),
            revoked: false,
        };

        self.backend.insert_token(&record).await?;

        debug!(entity = %entity_id, ttl = ttl_seconds, "Session token issued");

        Ok((bearer, record))
    }

    /// Validates a bearer token.
    ///
    /// Validity requires: not expired, not revoked, the issuing role (if
    /// any) still present, and the consumed secret id (if any) not revoked.
    pub async fn validate(&self, bearer: &str) -> Result<AuthContext, AuthError> {
        let record = self
            .backend
            .get_token(&sha256_hex(bearer.as_bytes()))
            .await?
            .ok_or(AuthError::TokenNotFound)?;

        if record.revoked {
            return Err(AuthError::TokenRevoked);
        }
        if record.expires_at <= Utc::now() {
            return Err(AuthError::TokenExpired);
        }

        if let Some(role_name) = &record.role_name {
            if self.backend.get_role(role_name).await?.is_none() {
                return Err(AuthError::TokenRevoked);
            }
        }

        if let Some(secret_id_ref) = record.secret_id_ref {
            match self.backend.get_secret_id(secret_id_ref).await? {
                Some(secret_id) if !secret_id.revoked => {}
                // Exhausted secret ids stay revoked-but-consumable history;
                // the tokens they minted remain valid only while the row
                // itself is intact and unrevoked by an operator.
                Some(_) | None => return Err(AuthError::TokenRevoked),
            }
        }

        Ok(AuthContext {
            entity_id: record.entity_id,
            role_name: record.role_name,
            policies: record.policies,
            auth_method: AuthMethod::AppRole,
            expires_at: Some(record.expires_at),
            bound_cert_fingerprint: record.bound_cert_fingerprint,
        })
    }

    /// Revokes a bearer token. Returns whether a live token was revoked.
    pub async fn revoke(&self, bearer: &str) -> Result<bool, AuthError> {
        Ok(self
            .backend
            .revoke_token(&sha256_hex(bearer.as_bytes()))
            .await?)
    }

    /// Binds a bearer token to a certificate fingerprint.
    pub async fn bind_certificate(
        &self,
        bearer: &str,
        fingerprint: &str,
    ) -> Result<(), AuthError> {
        self.backend
            .bind_token_certificate(&sha256_hex(bearer.as_bytes()), fingerprint)
            .await?;
        Ok(())
    }

    /// Removes expired token rows.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        Ok(self.backend.purge_expired_tokens(Utc::now()).await?)
    }
}

#[async_trait::async_trait]
impl crate::backend::AuthBackend for TokenStore {
    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError> {
        TokenStore::validate(self, token).await
    }

    fn name(&self) -> &'static str {
        "session-token"
    }
}

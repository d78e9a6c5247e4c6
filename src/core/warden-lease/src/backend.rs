//! Credential backend seam.
//!
//! Concrete integrations (PostgreSQL, Redis, cloud IAM) live outside the
//! core and implement [`CredentialBackend`]. The built-in ephemeral
//! backend mints self-contained random credentials for development and
//! tests.

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

use warden_crypto::random::generate_token;

use crate::error::LeaseError;

/// A credential minted by a backend.
#[derive(Debug, Clone)]
pub struct MintedCredential {
    /// Opaque handle the backend needs to destroy the credential later.
    pub handle: String,
    /// Credential material returned to the caller. Never persisted and
    /// never logged.
    pub credentials: serde_json::Value,
}

/// A dynamic credential source.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Backend kind stored on lease records, e.g. `postgres`.
    fn kind(&self) -> &'static str;

    /// Mints a credential for a dynamic role.
    async fn mint(&self, role: &str, ttl: Duration) -> Result<MintedCredential, LeaseError>;

    /// Destroys a credential by handle. Must be idempotent.
    async fn revoke(&self, handle: &str) -> Result<(), LeaseError>;
}

/// In-process backend producing random username/password pairs.
#[derive(Default)]
pub struct EphemeralBackend {
    live: DashMap<String, String>,
}

impl EphemeralBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of credentials not yet revoked.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[async_trait]
impl CredentialBackend for EphemeralBackend {
    fn kind(&self) -> &'static str {
        "ephemeral"
    }

    async fn mint(&self, role: &str, _ttl: Duration) -> Result<MintedCredential, LeaseError> {
        let handle = Uuid::new_v4().to_string();
        let username = format!("w-{role}-{}", generate_token(4));
        let password = generate_token(24);

        self.live.insert(handle.clone(), username.clone());

        Ok(MintedCredential {
            handle,
            credentials: json!({
                "username": username,
                "password": password,
            }),
        })
    }

    async fn revoke(&self, handle: &str) -> Result<(), LeaseError> {
        self.live.remove(handle);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mint_and_revoke() {
        let backend = EphemeralBackend::new();

        let minted = backend.mint("db-ro", Duration::seconds(60)).await.unwrap();
        assert_eq!(backend.live_count(), 1);
        assert!(minted.credentials["username"]
            .as_str()
            .unwrap()
            .starts_with("w-db-ro-"));

        backend.revoke(&minted.handle).await.unwrap();
        assert_eq!(backend.live_count(), 0);

        // Idempotent.
        backend.revoke(&minted.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_credentials_unique() {
        let backend = EphemeralBackend::new();

        let a = backend.mint("r", Duration::seconds(60)).await.unwrap();
        let b = backend.mint("r", Duration::seconds(60)).await.unwrap();
        assert_ne!(a.credentials["password"], b.credentials["password"]);
        assert_ne!(a.handle, b.handle);
    }
}

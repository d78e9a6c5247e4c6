//! AppRole backend: role registry, secret id minting, login.

use std::sync::{Arc, OnceLock};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_audit::{kind, Actor, AuditEvent, AuditLog, Outcome};
use warden_crypto::random::generate_bytes;
use warden_storage::records::{RoleRecord, SecretIdRecord};
use warden_storage_sqlite::SqliteBackend;

use crate::context::AuthContext;
use crate::error::AuthError;
use crate::tokens::TokenStore;

/// Display prefix on minted secret ids.
const SECRET_ID_PREFIX: &str = "ws_";

/// Default session token lifetime, seconds.
const DEFAULT_TOKEN_TTL: i64 = 3600;

/// Options for role creation.
#[derive(Debug, Clone)]
pub struct RoleOptions {
    /// Policies bound to entities logging in through this role.
    pub policies: Vec<String>,
    /// Whether login requires a valid secret id.
    pub bind_secret_id: bool,
    /// Lifetime of minted secret ids, seconds.
    pub secret_id_ttl: Option<i64>,
    /// Number of logins a minted secret id permits.
    pub secret_id_num_uses: Option<i64>,
    /// Lifetime of session tokens issued on login, seconds.
    pub token_ttl: Option<i64>,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            bind_secret_id: true,
            secret_id_ttl: None,
            secret_id_num_uses: None,
            token_ttl: None,
        }
    }
}

/// The AppRole authentication backend.
#[derive(Clone)]
pub struct AppRoleBackend {
    backend: SqliteBackend,
    tokens: TokenStore,
    audit: Arc<AuditLog>,
}

impl AppRoleBackend {
    /// Creates the backend.
    pub fn new(backend: SqliteBackend, tokens: TokenStore, audit: Arc<AuditLog>) -> Self {
        Self {
            backend,
            tokens,
            audit,
        }
    }

    /// Creates a role. The public `role_id` is generated here and never
    /// changes.
    pub async fn create_role(
        &self,
        name: &str,
        options: RoleOptions,
        actor: &Actor,
    ) -> Result<RoleRecord, AuthError> {
        validate_role_name(name)?;

        let record = RoleRecord {
            name: name.to_string(),
            role_id: Uuid::new_v4(),
            policies: options.policies,
            bind_secret_id: options.bind_secret_id,
            secret_id_ttl: options.secret_id_ttl,
            secret_id_num_uses: options.secret_id_num_uses,
            token_ttl: options.token_ttl.unwrap_or(DEFAULT_TOKEN_TTL),
            created_at: Utc::now(),
        };

        self.backend.insert_role(&record).await.map_err(|e| match e {
            warden_storage::StorageError::Conflict(_) => AuthError::RoleExists(name.to_string()),
            other => other.into(),
        })?;

        self.audit
            .append(AuditEvent::new(
                kind::AUTH_ROLE_CREATE,
                actor.clone(),
                format!("auth/role/{name}"),
                Outcome::Success,
            ))
            .await?;

        info!(role = %name, role_id = %record.role_id, "Role created");

        Ok(record)
    }

    /// Deletes a role. Outstanding tokens issued through it become invalid
    /// at their next validation.
    pub async fn delete_role(&self, name: &str, actor: &Actor) -> Result<(), AuthError> {
        if !self.backend.delete_role(name).await? {
            return Err(AuthError::RoleNotFound(name.to_string()));
        }

        self.audit
            .append(AuditEvent::new(
                kind::AUTH_ROLE_DELETE,
                actor.clone(),
                format!("auth/role/{name}"),
                Outcome::Success,
            ))
            .await?;

        info!(role = %name, "Role deleted");

        Ok(())
    }

    /// Fetches a role by name.
    pub async fn get_role(&self, name: &str) -> Result<RoleRecord, AuthError> {
        self.backend
            .get_role(name)
            .await?
            .ok_or_else(|| AuthError::RoleNotFound(name.to_string()))
    }

    /// Lists all roles.
    pub async fn list_roles(&self) -> Result<Vec<RoleRecord>, AuthError> {
        Ok(self.backend.list_roles().await?)
    }

    /// Mints a secret id for a role. The plaintext is returned exactly
    /// once; storage keeps an Argon2id hash.
    pub async fn mint_secret_id(
        &self,
        role_name: &str,
        actor: &Actor,
    ) -> Result<(String, SecretIdRecord), AuthError> {
        let role = self.get_role(role_name).await?;

        let plaintext = format!("{SECRET_ID_PREFIX}{}", BASE64.encode(generate_bytes(32)));
        let hash = hash_secret(&plaintext)?;

        let record = SecretIdRecord {
            id: Uuid::new_v4(),
            role_name: role.name.clone(),
            secret_id_hash: hash,
            uses_remaining: role.secret_id_num_uses,
            expires_at: role
                .secret_id_ttl
                .map(|ttl| Utc::now() + Duration::seconds(ttl)),
            revoked: false,
            created_at: Utc::now(),
        };

        self.backend.insert_secret_id(&record).await?;

        self.audit
            .append(
                AuditEvent::new(
                    kind::AUTH_SECRET_ID_MINT,
                    actor.clone(),
                    format!("auth/role/{role_name}"),
                    Outcome::Success,
                )
                .with_meta("secret_id", record.id.to_string()),
            )
            .await?;

        debug!(role = %role_name, secret_id = %record.id, "Secret id minted");

        Ok((plaintext, record))
    }

    /// Revokes a secret id. Tokens minted through it become invalid at
    /// their next validation.
    pub async fn revoke_secret_id(&self, id: Uuid) -> Result<(), AuthError> {
        self.backend.revoke_secret_id(id).await?;
        Ok(())
    }

    /// Logs in with `(role_id, secret_id?)` and issues a session token.
    ///
    /// Every failure path returns the same `InvalidCredentials` and burns
    /// comparable work, so callers cannot probe which component failed.
    pub async fn login(
        &self,
        role_id: &str,
        secret_id: Option<&str>,
    ) -> Result<(String, AuthContext), AuthError> {
        match self.try_login(role_id, secret_id).await {
            Ok(result) => {
                self.audit
                    .append(AuditEvent::new(
                        kind::AUTH_LOGIN,
                        Actor::app(role_id),
                        format!("auth/login/{role_id}"),
                        Outcome::Success,
                    ))
                    .await?;
                Ok(result)
            }
            Err(AuthError::InvalidCredentials) => {
                warn!(role_id = %role_id, "Login failed");
                self.audit
                    .append(AuditEvent::new(
                        kind::AUTH_LOGIN,
                        Actor::app(role_id),
                        format!("auth/login/{role_id}"),
                        Outcome::Denied,
                    ))
                    .await?;
                Err(AuthError::InvalidCredentials)
            }
            Err(other) => Err(other),
        }
    }

    async fn try_login(
        &self,
        role_id: &str,
        secret_id: Option<&str>,
    ) -> Result<(String, AuthContext), AuthError> {
        let Ok(role_uuid) = Uuid::parse_str(role_id) else {
            burn_verification();
            return Err(AuthError::InvalidCredentials);
        };

        let Some(role) = self.backend.get_role_by_id(role_uuid).await? else {
            burn_verification();
            return Err(AuthError::InvalidCredentials);
        };

        let mut consumed: Option<Uuid> = None;

        if role.bind_secret_id {
            let Some(presented) = secret_id else {
                burn_verification();
                return Err(AuthError::InvalidCredentials);
            };

            let candidates = self.backend.list_secret_ids_for_role(&role.name).await?;
            let now = Utc::now();

            let matched = candidates.into_iter().find(|candidate| {
                let unexpired = candidate.expires_at.map(|at| at > now).unwrap_or(true);
                let has_uses = candidate.uses_remaining.map(|n| n > 0).unwrap_or(true);
                unexpired
                    && has_uses
                    && verify_secret(presented, &candidate.secret_id_hash)
            });

            let Some(matched) = matched else {
                burn_verification();
                return Err(AuthError::InvalidCredentials);
            };

            if let Some(uses) = matched.uses_remaining {
                // Exhaustion zeroes the counter; the row itself stays so
                // tokens minted through it remain traceable and valid.
                self.backend
                    .consume_secret_id_use(matched.id, Some(uses - 1), false)
                    .await?;
            }

            consumed = Some(matched.id);
        }

        let entity_id = format!("role:{}", role.name);
        let (bearer, record) = self
            .tokens
            .issue(
                &entity_id,
                Some(&role.name),
                consumed,
                &role.policies,
                role.token_ttl,
                None,
            )
            .await?;

        let context = AuthContext {
            entity_id,
            role_name: Some(role.name),
            policies: record.policies,
            auth_method: crate::context::AuthMethod::AppRole,
            expires_at: Some(record.expires_at),
            bound_cert_fingerprint: None,
        };

        Ok((bearer, context))
    }
}

fn validate_role_name(name: &str) -> Result<(), AuthError> {
    if name.is_empty() {
        return Err(AuthError::InvalidInput("role name cannot be empty".into()));
    }
    if name.len() > 64 {
        return Err(AuthError::InvalidInput("role name too long".into()));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

    if !valid {
        return Err(AuthError::InvalidInput(
            "role name must match [a-z0-9_-]+".into(),
        ));
    }

    Ok(())
}

fn hash_secret(secret: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Crypto(e.to_string()))
}

fn verify_secret(secret: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

/// Runs one Argon2 verification against a throwaway hash so rejected
/// logins cost roughly the same regardless of which component failed.
fn burn_verification() {
    static DUMMY: OnceLock<String> = OnceLock::new();
    let hash = DUMMY.get_or_init(|| {
        hash_secret("warden-dummy-credential").unwrap_or_else(|_| String::new())
    });
    let _ = verify_secret("warden-dummy-probe", hash);
}

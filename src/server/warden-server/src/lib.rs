//! # Warden Server
//!
//! Glue: wires storage, seal, audit, policy, secrets, PKI, auth and the
//! lease manager into a [`Core`] facade exposing the administrative
//! operations as plain async methods, and runs the agent channel
//! listeners plus the background tasks (lease sweeper, housekeeping,
//! certificate-expiry scan). The HTTP layer is an external consumer of
//! [`Core`]; nothing in this crate speaks HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod ratelimit;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use warden_audit::{
    kind as audit_kind, Actor, AuditEvent, AuditLog, ChainVerification, Outcome,
};
use warden_auth::{
    AppRoleBackend, AuthBackend, AuthContext, AuthError, RoleOptions, RootTokenBackend,
    TokenStore,
};
use warden_lease::{
    CredentialBackend, EphemeralBackend, IssuedLease, LeaseConfig, LeaseError, LeaseManager,
};
use warden_pki::{CaRequest, CertificateAuthority, PkiError, SignedCertificate};
use warden_policy::{
    Capability, Decision, Policy, PolicyError, PolicyStore, Principal, RequestContext,
};
use warden_seal::{InitResult, SealConfig, SealError, SealManager, SealStatus};
use warden_secrets::{SecretData, SecretsEngine, SecretsError, VersionInfo};
use warden_session::{
    ListenerTls, Notification, NotificationHub, RunningSessionServer, SessionConfig,
    SessionEngines, SessionError,
};
use warden_storage::records::{
    CertificateRecord, CertificateType, LeaseRecord, RoleRecord, SecretType,
};
use warden_storage::StorageError;
use warden_storage_sqlite::{AuditSearchFilter, SqliteBackend};

pub use config::CoreConfig;
pub use ratelimit::RateLimiter;

/// Unified error for the core facade.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Seal state error.
    #[error(transparent)]
    Seal(#[from] SealError),

    /// Authentication error.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Policy error.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Secrets error.
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// PKI error.
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Lease error.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Audit error.
    #[error(transparent)]
    Audit(#[from] warden_audit::AuditError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Session/channel error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The caller lacks admin capability.
    #[error("access denied")]
    AccessDenied,

    /// Too many requests for this key in the current window.
    #[error("rate limited")]
    RateLimited,
}

/// The wired core.
pub struct Core {
    config: CoreConfig,
    storage: SqliteBackend,
    seal: Mutex<SealManager>,
    keys: warden_seal::KeyAccess,
    audit: Arc<AuditLog>,
    policies: Arc<PolicyStore>,
    secrets: SecretsEngine,
    pki: CertificateAuthority,
    tokens: TokenStore,
    approle: AppRoleBackend,
    leases: Arc<LeaseManager>,
    notifications: NotificationHub,
    login_limiter: RateLimiter,
}

impl Core {
    /// Opens storage and wires every engine. The core starts sealed (or
    /// uninitialized on first boot).
    pub async fn open(config: CoreConfig) -> Result<Self, CoreError> {
        Self::open_with_backend(config, Arc::new(EphemeralBackend::new())).await
    }

    /// Opens the core with a specific credential backend implementation.
    pub async fn open_with_backend(
        config: CoreConfig,
        credentials: Arc<dyn CredentialBackend>,
    ) -> Result<Self, CoreError> {
        let storage = SqliteBackend::open(&config.data_dir).await?;

        let seal = SealManager::new(storage.clone()).await?;
        let keys = seal.key_access();

        let audit = Arc::new(AuditLog::new(storage.clone(), keys.clone()));
        let policies = Arc::new(PolicyStore::open(storage.clone()).await?);
        let secrets = SecretsEngine::new(
            storage.clone(),
            keys.clone(),
            policies.clone(),
            audit.clone(),
        );
        let pki = CertificateAuthority::new(storage.clone(), keys.clone(), audit.clone());
        let tokens = TokenStore::new(storage.clone());
        let approle = AppRoleBackend::new(storage.clone(), tokens.clone(), audit.clone());

        let leases = Arc::new(LeaseManager::new(
            storage.clone(),
            policies.clone(),
            audit.clone(),
            credentials,
            LeaseConfig {
                sweep_interval: config.sweep_interval,
                ..LeaseConfig::default()
            },
        ));

        let login_limiter = RateLimiter::new(config.login_rate_limit);

        Ok(Self {
            config,
            storage,
            seal: Mutex::new(seal),
            keys,
            audit,
            policies,
            secrets,
            pki,
            tokens,
            approle,
            leases,
            notifications: NotificationHub::new(),
            login_limiter,
        })
    }

    /// The storage backend (integration surface for external consumers).
    pub fn storage(&self) -> &SqliteBackend {
        &self.storage
    }

    /// The notification hub feeding agent sessions.
    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }

    // -- sys.* ------------------------------------------------------------

    /// `sys.init`: one-shot initialization. Shares and the root token are
    /// returned exactly once.
    pub async fn sys_init(&self, total_shares: u8, threshold: u8) -> Result<InitResult, CoreError> {
        let mut seal = self.seal.lock().await;
        Ok(seal
            .initialize(SealConfig {
                shares: total_shares,
                threshold,
            })
            .await?)
    }

    /// `sys.unseal`: submits one share. Seal transitions are audited once
    /// the signing key exists.
    pub async fn sys_unseal(&self, share_b64: &str) -> Result<SealStatus, CoreError> {
        let share = warden_crypto::shamir::Share::from_base64(share_b64)
            .map_err(|e| SealError::InvalidShare(e.to_string()))?;

        let status = {
            let mut seal = self.seal.lock().await;
            seal.submit_share(&share).await?
        };

        if !status.sealed {
            // First unseal also records initialization: the audit signing
            // key does not exist before this point.
            if self.storage.audit_tail().await?.is_none() {
                self.audit
                    .append(AuditEvent::new(
                        audit_kind::SEAL_INIT,
                        Actor::system("core"),
                        "sys/seal",
                        Outcome::Success,
                    ))
                    .await?;
            }
            self.audit
                .append(AuditEvent::new(
                    audit_kind::SEAL_UNSEAL,
                    Actor::system("core"),
                    "sys/seal",
                    Outcome::Success,
                ))
                .await?;
        }

        Ok(status)
    }

    /// `sys.seal`: zeroes the master key. The transition is audited while
    /// the signing key still exists.
    pub async fn sys_seal(&self, ctx: &AuthContext) -> Result<SealStatus, CoreError> {
        self.require_admin(ctx)?;

        self.audit
            .append(AuditEvent::new(
                audit_kind::SEAL_SEAL,
                Actor::admin(&ctx.entity_id),
                "sys/seal",
                Outcome::Success,
            ))
            .await?;

        let mut seal = self.seal.lock().await;
        Ok(seal.seal()?)
    }

    /// `sys.status`.
    pub async fn sys_status(&self) -> SealStatus {
        self.seal.lock().await.status()
    }

    /// Validates a bearer credential (root token or session token).
    pub async fn authenticate(&self, token: &str) -> Result<AuthContext, CoreError> {
        if token.starts_with("wt_") {
            return Ok(self.tokens.validate(token).await?);
        }

        let root = RootTokenBackend::new(Arc::new(self.storage.clone()));
        Ok(root.validate(token).await?)
    }

    // -- auth.* -----------------------------------------------------------

    /// `auth.create_role` (admin).
    pub async fn auth_create_role(
        &self,
        ctx: &AuthContext,
        name: &str,
        options: RoleOptions,
    ) -> Result<RoleRecord, CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .approle
            .create_role(name, options, &Actor::admin(&ctx.entity_id))
            .await?)
    }

    /// `auth.delete_role` (admin).
    pub async fn auth_delete_role(&self, ctx: &AuthContext, name: &str) -> Result<(), CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .approle
            .delete_role(name, &Actor::admin(&ctx.entity_id))
            .await?)
    }

    /// `auth.list_roles` (admin).
    pub async fn auth_list_roles(&self, ctx: &AuthContext) -> Result<Vec<RoleRecord>, CoreError> {
        self.require_admin(ctx)?;
        Ok(self.approle.list_roles().await?)
    }

    /// `auth.mint_secret_id` (admin). The plaintext is shown exactly once.
    pub async fn auth_mint_secret_id(
        &self,
        ctx: &AuthContext,
        role_name: &str,
    ) -> Result<String, CoreError> {
        self.require_admin(ctx)?;
        let (secret_id, _) = self
            .approle
            .mint_secret_id(role_name, &Actor::admin(&ctx.entity_id))
            .await?;
        Ok(secret_id)
    }

    /// `auth.login`: exchanges `(role_id, secret_id?)` for a session token.
    pub async fn auth_login(
        &self,
        role_id: &str,
        secret_id: Option<&str>,
    ) -> Result<(String, AuthContext), CoreError> {
        if !self.login_limiter.check(&format!("login:{role_id}")) {
            return Err(CoreError::RateLimited);
        }
        Ok(self.approle.login(role_id, secret_id).await?)
    }

    // -- policy.* ---------------------------------------------------------

    /// `policy.create` / `policy.update` (admin). Publishes the change to
    /// connected sessions.
    pub async fn policy_set(&self, ctx: &AuthContext, policy: Policy) -> Result<(), CoreError> {
        self.require_admin(ctx)?;

        let name = policy.name.clone();
        self.policies.set_policy(policy).await?;

        self.audit
            .append(AuditEvent::new(
                audit_kind::POLICY_WRITE,
                Actor::admin(&ctx.entity_id),
                format!("policy/{name}"),
                Outcome::Success,
            ))
            .await?;

        self.notifications.publish(
            None,
            Notification::PolicyUpdated {
                policy_name: name,
            },
        );

        Ok(())
    }

    /// `policy.delete` (admin).
    pub async fn policy_delete(&self, ctx: &AuthContext, name: &str) -> Result<(), CoreError> {
        self.require_admin(ctx)?;

        self.policies.delete_policy(name).await?;

        self.audit
            .append(AuditEvent::new(
                audit_kind::POLICY_DELETE,
                Actor::admin(&ctx.entity_id),
                format!("policy/{name}"),
                Outcome::Success,
            ))
            .await?;

        self.notifications.publish(
            None,
            Notification::PolicyUpdated {
                policy_name: name.to_string(),
            },
        );

        Ok(())
    }

    /// `policy.get`.
    pub fn policy_get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name)
    }

    /// `policy.list`.
    pub fn policy_list(&self) -> Vec<Arc<Policy>> {
        self.policies.list()
    }

    /// `policy.simulate`: evaluates a hypothetical request.
    pub fn policy_simulate(
        &self,
        policies: &[String],
        path: &str,
        capability: Capability,
        ctx: &RequestContext,
    ) -> Decision {
        self.policies.evaluate(policies, path, capability, ctx)
    }

    // -- secret.* ---------------------------------------------------------

    /// `secret.write`. Publishes a rotation notice on success.
    pub async fn secret_write(
        &self,
        ctx: &AuthContext,
        path: &str,
        data: &serde_json::Value,
        secret_type: SecretType,
    ) -> Result<i64, CoreError> {
        let principal = principal_of(ctx);
        let version = self
            .secrets
            .write(path, data, secret_type, &principal, &RequestContext::now())
            .await?;

        self.notifications.publish(
            None,
            Notification::SecretRotated {
                path: path.to_string(),
                new_version: version,
            },
        );

        Ok(version)
    }

    /// `secret.read`.
    pub async fn secret_read(
        &self,
        ctx: &AuthContext,
        path: &str,
        version: Option<i64>,
    ) -> Result<SecretData, CoreError> {
        let principal = principal_of(ctx);
        Ok(self
            .secrets
            .read(path, version, &principal, &RequestContext::now())
            .await?)
    }

    /// `secret.delete` (tombstone).
    pub async fn secret_delete(&self, ctx: &AuthContext, path: &str) -> Result<(), CoreError> {
        let principal = principal_of(ctx);
        Ok(self
            .secrets
            .delete(path, &principal, &RequestContext::now())
            .await?)
    }

    /// `secret.list_versions`.
    pub async fn secret_list_versions(
        &self,
        ctx: &AuthContext,
        path: &str,
    ) -> Result<Vec<VersionInfo>, CoreError> {
        let principal = principal_of(ctx);
        Ok(self
            .secrets
            .list_versions(path, &principal, &RequestContext::now())
            .await?)
    }

    // -- pki.* ------------------------------------------------------------

    /// `pki.generate_root` (admin).
    pub async fn pki_generate_root(
        &self,
        ctx: &AuthContext,
        request: &CaRequest,
    ) -> Result<CertificateRecord, CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .pki
            .generate_root_ca(request, &Actor::admin(&ctx.entity_id))
            .await?)
    }

    /// `pki.generate_intermediate` (admin).
    pub async fn pki_generate_intermediate(
        &self,
        ctx: &AuthContext,
        request: &CaRequest,
        parent_root_id: Uuid,
    ) -> Result<CertificateRecord, CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .pki
            .generate_intermediate_ca(request, parent_root_id, &Actor::admin(&ctx.entity_id))
            .await?)
    }

    /// `pki.sign_csr` (admin surface; agents go through the channel).
    pub async fn pki_sign_csr(
        &self,
        ctx: &AuthContext,
        csr_pem: &str,
        signing_ca_id: Uuid,
        cert_type: CertificateType,
        validity_days: u32,
    ) -> Result<SignedCertificate, CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .pki
            .sign_csr(
                csr_pem,
                signing_ca_id,
                cert_type,
                validity_days,
                &Actor::admin(&ctx.entity_id),
            )
            .await?)
    }

    /// `pki.list`.
    pub async fn pki_list(
        &self,
        ctx: &AuthContext,
        cert_type: Option<CertificateType>,
    ) -> Result<Vec<CertificateRecord>, CoreError> {
        self.require_admin(ctx)?;
        Ok(self.pki.list(cert_type).await?)
    }

    /// `pki.get`.
    pub async fn pki_get(&self, id: Uuid) -> Result<CertificateRecord, CoreError> {
        Ok(self.pki.get(id).await?)
    }

    /// `pki.revoke` (admin).
    pub async fn pki_revoke(
        &self,
        ctx: &AuthContext,
        certificate_id: Uuid,
        reason: &str,
    ) -> Result<CertificateRecord, CoreError> {
        self.require_admin(ctx)?;
        Ok(self
            .pki
            .revoke(certificate_id, reason, &Actor::admin(&ctx.entity_id))
            .await?)
    }

    /// Direct access to the CA (channel wiring, chain retrieval).
    pub fn pki(&self) -> &CertificateAuthority {
        &self.pki
    }

    // -- lease.* ----------------------------------------------------------

    /// `lease.list` (admins see everything, entities see their own).
    pub async fn lease_list(&self, ctx: &AuthContext) -> Result<Vec<LeaseRecord>, CoreError> {
        if ctx.is_admin() {
            Ok(self.leases.list(None).await?)
        } else {
            Ok(self.leases.list(Some(&ctx.entity_id)).await?)
        }
    }

    /// `lease.renew`.
    pub async fn lease_renew(
        &self,
        ctx: &AuthContext,
        lease_id: Uuid,
        increment: chrono::Duration,
    ) -> Result<chrono::DateTime<Utc>, CoreError> {
        let principal = principal_of(ctx);
        Ok(self
            .leases
            .renew(lease_id, increment, &principal, &RequestContext::now())
            .await?)
    }

    /// `lease.revoke`.
    pub async fn lease_revoke(&self, ctx: &AuthContext, lease_id: Uuid) -> Result<(), CoreError> {
        let principal = principal_of(ctx);
        Ok(self.leases.revoke(lease_id, &principal).await?)
    }

    /// `lease.stats`: `(active, revoked)`.
    pub async fn lease_stats(&self) -> Result<(i64, i64), CoreError> {
        Ok(self.leases.stats().await?)
    }

    /// Dynamic issuance for admin/API callers (agents use the channel).
    pub async fn lease_issue(
        &self,
        ctx: &AuthContext,
        role: &str,
        ttl: Option<chrono::Duration>,
    ) -> Result<IssuedLease, CoreError> {
        let principal = principal_of(ctx);
        Ok(self
            .leases
            .issue(role, ttl, &principal, &RequestContext::now())
            .await?)
    }

    // -- audit.* ----------------------------------------------------------

    /// `audit.search` / `audit.export` (admin). Read-only.
    pub async fn audit_search(
        &self,
        ctx: &AuthContext,
        filter: &AuditSearchFilter,
    ) -> Result<Vec<warden_storage::records::AuditEntryRecord>, CoreError> {
        self.require_admin(ctx)?;
        Ok(self.audit.export(filter).await?)
    }

    /// `audit.verify_chain`.
    pub async fn audit_verify_chain(&self) -> Result<ChainVerification, CoreError> {
        Ok(self.audit.verify_chain().await?)
    }

    // -- serving ----------------------------------------------------------

    /// Starts the agent channel, lease sweeper and housekeeping tasks.
    ///
    /// Requires an unsealed core with at least a root CA (one is generated
    /// on first serve for convenience). Returns a handle carrying the
    /// bound addresses; cancel the token for graceful shutdown.
    pub async fn serve(self: &Arc<Self>, cancel: CancellationToken) -> Result<RunningCore, CoreError> {
        if self.keys.is_sealed() {
            return Err(CoreError::Seal(SealError::Sealed));
        }

        // First boot: a root CA must exist before any TLS identity can.
        if self.pki.select_signing_ca().await.is_err() {
            info!("No CA present; generating a root CA");
            self.pki
                .generate_root_ca(
                    &CaRequest {
                        common_name: "warden-root".to_string(),
                        organization: "Warden".to_string(),
                        key_type: "ecdsa".to_string(),
                        key_bits: None,
                        validity_days: 3650,
                    },
                    &Actor::system("core"),
                )
                .await?;
        }

        let identity = self
            .pki
            .issue_server_identity(
                &self.config.server_name,
                &[self.config.server_name.clone()],
                365,
            )
            .await?;

        let mut server_cert_pem = identity.certificate_pem.clone();
        if !identity.chain_pem.is_empty() {
            server_cert_pem.push_str(&identity.chain_pem);
        }

        let session_server = warden_session::start(
            SessionEngines {
                storage: self.storage.clone(),
                tokens: self.tokens.clone(),
                approle: self.approle.clone(),
                pki: self.pki.clone(),
                secrets: self.secrets.clone(),
                leases: self.leases.clone(),
                audit: self.audit.clone(),
                notifications: self.notifications.clone(),
            },
            SessionConfig {
                bootstrap_addr: self.config.bootstrap_addr,
                session_addr: self.config.session_addr,
                heartbeat_interval: self.config.heartbeat_interval,
                request_deadline: std::time::Duration::from_secs(30),
                drain_deadline: std::time::Duration::from_secs(10),
                client_cert_validity_days: self.config.client_cert_validity_days,
            },
            ListenerTls {
                server_cert_pem,
                server_key_pem: identity.private_key_pem.clone(),
                ca_chain_pem: identity.ca_chain_pem.clone(),
            },
            cancel.clone(),
        )
        .await?;

        let sweeper = self.leases.start_sweeper(cancel.clone());
        let bridge = self.spawn_lease_bridge(cancel.clone());
        let housekeeping = self.spawn_housekeeping(cancel.clone());

        Ok(RunningCore {
            bootstrap_addr: session_server.bootstrap_addr,
            session_addr: session_server.session_addr,
            ca_chain_pem: identity.ca_chain_pem,
            session_server,
            tasks: vec![sweeper, bridge, housekeeping],
        })
    }

    /// Forwards lease revocation notices into the session notification hub.
    fn spawn_lease_bridge(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(self);
        let mut notices = core.leases.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    notice = notices.recv() => {
                        match notice {
                            Ok(notice) => {
                                core.notifications.publish(
                                    Some(notice.entity_id.clone()),
                                    Notification::LeaseRevoked {
                                        lease_id: notice.lease_id.to_string(),
                                        reason: notice.reason.as_str().to_string(),
                                    },
                                );
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        })
    }

    /// Periodic housekeeping: expired-token purge, tombstone purge past
    /// retention, and certificate-expiry notifications.
    fn spawn_housekeeping(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.housekeeping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = core.tokens.purge_expired().await {
                            warn!(error = %e, "Token purge failed");
                        }
                        if let Err(e) = core
                            .secrets
                            .purge_tombstones(core.config.secret_retention)
                            .await
                        {
                            warn!(error = %e, "Tombstone purge failed");
                        }
                        core.notify_expiring_certificates().await;
                    }
                }
            }
        })
    }

    async fn notify_expiring_certificates(&self) {
        let expiring = match self.pki.expiring_within(self.config.cert_expiry_window).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Certificate expiry scan failed");
                return;
            }
        };

        for record in expiring
            .iter()
            .filter(|r| r.cert_type == CertificateType::AgentClient)
        {
            self.notifications.publish(
                None,
                Notification::CertExpiring {
                    cert_id: record.id.to_string(),
                    expires_at: record.not_after.timestamp(),
                },
            );
        }
    }

    fn require_admin(&self, ctx: &AuthContext) -> Result<(), CoreError> {
        if ctx.is_admin() {
            Ok(())
        } else {
            Err(CoreError::AccessDenied)
        }
    }
}

/// Maps an authenticated context onto a policy principal.
fn principal_of(ctx: &AuthContext) -> Principal {
    Principal {
        entity_id: ctx.entity_id.clone(),
        actor_type: if ctx.is_admin() { "admin" } else { "app" }.to_string(),
        policies: ctx.policies.clone(),
        admin: ctx.is_admin(),
    }
}

/// A serving core: bound channel addresses plus background task handles.
pub struct RunningCore {
    /// Bound bootstrap listener address.
    pub bootstrap_addr: std::net::SocketAddr,
    /// Bound session listener address.
    pub session_addr: std::net::SocketAddr,
    /// CA bundle agents must trust (distribute out of band).
    pub ca_chain_pem: String,
    session_server: RunningSessionServer,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningCore {
    /// Waits for every background task after cancellation.
    pub async fn join(self) {
        self.session_server.join().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

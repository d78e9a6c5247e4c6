//! # Warden Lease
//!
//! Lifecycle of dynamic credentials: issue against a credential backend,
//! renew under a hard lifetime cap, revoke on demand, and a background
//! sweeper that revokes leases past their expiry.
//!
//! The sweeper and explicit revocation race through a `revoking` claim on
//! the lease row, so exactly one path destroys the backend credential.
//! Backend revocation failures are retried with jittered exponential
//! backoff; after the cap the lease is still marked revoked locally (the
//! credential is assumed compromised) and the failure is audited.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_audit::{kind, Actor, AuditEvent, AuditLog, Outcome};
use warden_policy::{Capability, Decision, PolicyStore, Principal, RequestContext};
use warden_storage::records::LeaseRecord;
use warden_storage_sqlite::{CoupledWrite, SqliteBackend};

pub use backend::{CredentialBackend, EphemeralBackend, MintedCredential};
pub use error::LeaseError;

/// Why a lease ended, carried on revocation notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    /// Revoked by its owner or an operator.
    Requested,
    /// Expired and collected by the sweeper.
    Expired,
}

impl RevocationReason {
    /// Stable string form for notifications and audit metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Expired => "expired",
        }
    }
}

/// Broadcast notice emitted when a lease is revoked.
#[derive(Debug, Clone)]
pub struct LeaseNotice {
    /// The lease.
    pub lease_id: Uuid,
    /// Owning entity (sessions filter on this).
    pub entity_id: String,
    /// Why the lease ended.
    pub reason: RevocationReason,
}

/// Tunables for the manager and its sweeper.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Default TTL when the caller does not request one.
    pub default_ttl: Duration,
    /// Hard lifetime cap applied to every lease.
    pub max_ttl: Duration,
    /// Sweep interval for the background expiration task.
    pub sweep_interval: StdDuration,
    /// First backend revocation retry delay.
    pub revoke_retry_base: StdDuration,
    /// Backend revocation retry delay cap.
    pub revoke_retry_cap: StdDuration,
    /// Backend revocation attempts before giving up.
    pub revoke_max_attempts: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::seconds(300),
            max_ttl: Duration::seconds(3600),
            sweep_interval: StdDuration::from_secs(5),
            revoke_retry_base: StdDuration::from_secs(1),
            revoke_retry_cap: StdDuration::from_secs(60),
            revoke_max_attempts: 5,
        }
    }
}

/// An issued lease handed back to the caller.
#[derive(Debug, Clone)]
pub struct IssuedLease {
    /// Lease id for renew/revoke.
    pub lease_id: Uuid,
    /// Credential material. Never persisted by the core.
    pub credentials: serde_json::Value,
    /// Current expiry.
    pub expires_at: DateTime<Utc>,
}

/// The lease manager.
pub struct LeaseManager {
    backend: SqliteBackend,
    policies: Arc<PolicyStore>,
    audit: Arc<AuditLog>,
    credentials: Arc<dyn CredentialBackend>,
    notices: broadcast::Sender<LeaseNotice>,
    config: LeaseConfig,
}

impl LeaseManager {
    /// Creates the manager.
    pub fn new(
        backend: SqliteBackend,
        policies: Arc<PolicyStore>,
        audit: Arc<AuditLog>,
        credentials: Arc<dyn CredentialBackend>,
        config: LeaseConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            backend,
            policies,
            audit,
            credentials,
            notices,
            config,
        }
    }

    /// Subscribes to lease revocation notices.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseNotice> {
        self.notices.subscribe()
    }

    /// Issues a dynamic credential for `role` and records its lease.
    ///
    /// The policy anchor is `dynamic/<role>` with the `read` capability;
    /// the requested TTL participates in condition evaluation and is
    /// clamped to the configured cap.
    pub async fn issue(
        &self,
        role: &str,
        requested_ttl: Option<Duration>,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<IssuedLease, LeaseError> {
        if role.is_empty()
            || !role
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(LeaseError::UnknownRole(role.to_string()));
        }

        let path = format!("dynamic/{role}");
        let ttl = requested_ttl
            .unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl);

        let mut ctx = ctx.clone();
        ctx.requested_ttl_seconds = Some(ttl.num_seconds().max(0) as u64);

        if !principal.admin {
            match self
                .policies
                .evaluate(&principal.policies, &path, Capability::Read, &ctx)
            {
                Decision::Allow { .. } => {}
                Decision::Deny { policy, .. } => {
                    self.audit
                        .append(AuditEvent::new(
                            kind::LEASE_ISSUE,
                            actor_of(principal),
                            path,
                            Outcome::Denied,
                        ))
                        .await?;
                    return Err(LeaseError::AccessDenied { policy });
                }
            }
        }

        let minted = self.credentials.mint(role, ttl).await?;

        let now = Utc::now();
        let record = LeaseRecord {
            lease_id: Uuid::new_v4(),
            entity_id: principal.entity_id.clone(),
            backend_kind: self.credentials.kind().to_string(),
            backend_handle: minted.handle,
            path: path.clone(),
            issued_at: now,
            expires_at: now + ttl,
            max_ttl_seconds: self.config.max_ttl.num_seconds(),
            revoking: false,
            revoked: false,
            revoked_at: None,
        };

        self.backend.insert_lease(&record).await?;

        self.audit
            .append(
                AuditEvent::new(
                    kind::LEASE_ISSUE,
                    actor_of(principal),
                    path,
                    Outcome::Success,
                )
                .with_meta("lease_id", record.lease_id.to_string())
                .with_meta("ttl_seconds", ttl.num_seconds().to_string()),
            )
            .await?;

        info!(lease = %record.lease_id, role = %role, "Dynamic credential issued");

        Ok(IssuedLease {
            lease_id: record.lease_id,
            credentials: minted.credentials,
            expires_at: record.expires_at,
        })
    }

    /// Renews a lease: `expires_at' = min(now + increment, issued_at + max_ttl)`.
    ///
    /// A zero increment is a no-op. Permitted to the lease owner, admins,
    /// and holders of `renew` capability on the lease path.
    pub async fn renew(
        &self,
        lease_id: Uuid,
        increment: Duration,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<DateTime<Utc>, LeaseError> {
        let lease = self.load(lease_id).await?;
        let now = Utc::now();

        if lease.revoked {
            return Err(LeaseError::LeaseRevoked(lease_id.to_string()));
        }
        if now >= lease.expires_at {
            return Err(LeaseError::LeaseExpired(lease_id.to_string()));
        }

        let is_owner = principal.entity_id == lease.entity_id;
        if !is_owner && !principal.admin {
            let decision =
                self.policies
                    .evaluate(&principal.policies, &lease.path, Capability::Renew, ctx);
            if let Decision::Deny { policy, .. } = decision {
                self.audit
                    .append(AuditEvent::new(
                        kind::LEASE_RENEW,
                        actor_of(principal),
                        lease.path.clone(),
                        Outcome::Denied,
                    ))
                    .await?;
                return Err(LeaseError::AccessDenied { policy });
            }
        }

        if increment.is_zero() {
            return Ok(lease.expires_at);
        }

        let cap = lease.issued_at + Duration::seconds(lease.max_ttl_seconds);
        let new_expiry = (now + increment).min(cap);

        if new_expiry <= lease.expires_at && lease.expires_at >= cap {
            return Err(LeaseError::MaxTtlExceeded(lease_id.to_string()));
        }

        if !self
            .backend
            .update_lease_expiry(lease_id, new_expiry)
            .await?
        {
            // The sweeper or a revoker claimed the row between our read
            // and the update.
            return Err(LeaseError::LeaseRevoked(lease_id.to_string()));
        }

        self.audit
            .append(
                AuditEvent::new(
                    kind::LEASE_RENEW,
                    actor_of(principal),
                    lease.path,
                    Outcome::Success,
                )
                .with_meta("lease_id", lease_id.to_string())
                .with_meta("expires_at", new_expiry.timestamp().to_string()),
            )
            .await?;

        debug!(lease = %lease_id, expires_at = %new_expiry, "Lease renewed");

        Ok(new_expiry)
    }

    /// Revokes a lease. Idempotent: revoking an already revoked lease is
    /// an ack without a second audit entry.
    pub async fn revoke(
        &self,
        lease_id: Uuid,
        principal: &Principal,
    ) -> Result<(), LeaseError> {
        let lease = self.load(lease_id).await?;

        if lease.revoked {
            return Ok(());
        }

        let is_owner = principal.entity_id == lease.entity_id;
        if !is_owner && !principal.admin {
            return Err(LeaseError::AccessDenied { policy: None });
        }

        if !self.backend.claim_lease_for_revocation(lease_id).await? {
            // Someone else is already destroying it.
            return Ok(());
        }

        self.finalize_revocation(&lease, actor_of(principal), RevocationReason::Requested)
            .await
    }

    /// Starts the background expiration sweeper. The task runs until the
    /// token is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval = ?manager.config.sweep_interval, "Lease sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Lease sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.sweep_once().await {
                            warn!(error = %e, "Lease sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// One sweep pass: claims and revokes every due lease. Returns the
    /// number collected.
    pub async fn sweep_once(&self) -> Result<usize, LeaseError> {
        let due = self.backend.due_leases(Utc::now(), 64).await?;
        let mut collected = 0;

        for lease in due {
            if !self
                .backend
                .claim_lease_for_revocation(lease.lease_id)
                .await?
            {
                continue;
            }

            debug!(lease = %lease.lease_id, "Sweeping expired lease");

            if let Err(e) = self
                .finalize_revocation(&lease, Actor::system("sweeper"), RevocationReason::Expired)
                .await
            {
                warn!(lease = %lease.lease_id, error = %e, "Sweep revocation failed");
                continue;
            }
            collected += 1;
        }

        Ok(collected)
    }

    /// Lists leases, optionally for one entity.
    pub async fn list(&self, entity_id: Option<&str>) -> Result<Vec<LeaseRecord>, LeaseError> {
        Ok(self.backend.list_leases(entity_id).await?)
    }

    /// Fetches a lease.
    pub async fn get(&self, lease_id: Uuid) -> Result<LeaseRecord, LeaseError> {
        self.load(lease_id).await
    }

    /// Returns `(active, revoked)` lease counts.
    pub async fn stats(&self) -> Result<(i64, i64), LeaseError> {
        Ok(self.backend.lease_stats(Utc::now()).await?)
    }

    /// Destroys the backend credential (with retries) and marks the lease
    /// revoked. The caller must hold the revocation claim.
    async fn finalize_revocation(
        &self,
        lease: &LeaseRecord,
        actor: Actor,
        reason: RevocationReason,
    ) -> Result<(), LeaseError> {
        let backend_ok = self.revoke_at_backend(&lease.backend_handle).await;

        let revoked_at = Utc::now();
        let event_kind = if backend_ok {
            kind::LEASE_REVOKE
        } else {
            kind::LEASE_REVOCATION_FAILED
        };
        let outcome = if backend_ok {
            Outcome::Success
        } else {
            Outcome::Failure
        };

        let event = AuditEvent::new(event_kind, actor, lease.path.clone(), outcome)
            .with_meta("lease_id", lease.lease_id.to_string())
            .with_meta("reason", reason.as_str());

        if let Err(e) = self
            .audit
            .append_coupled(
                event,
                CoupledWrite::MarkLeaseRevoked {
                    lease_id: lease.lease_id,
                    revoked_at,
                },
            )
            .await
        {
            // Nothing committed; hand the claim back so a later pass (or
            // an unsealed core) can finish the job.
            self.backend.release_lease_claim(lease.lease_id).await?;
            return Err(e.into());
        }

        if !backend_ok {
            error!(
                lease = %lease.lease_id,
                backend = %lease.backend_kind,
                "Backend revocation failed permanently; lease marked revoked locally"
            );
        }

        let _ = self.notices.send(LeaseNotice {
            lease_id: lease.lease_id,
            entity_id: lease.entity_id.clone(),
            reason,
        });

        info!(lease = %lease.lease_id, reason = reason.as_str(), "Lease revoked");

        Ok(())
    }

    /// Retries backend revocation with jittered exponential backoff.
    /// Returns whether the backend acknowledged.
    async fn revoke_at_backend(&self, handle: &str) -> bool {
        let mut delay = self.config.revoke_retry_base;

        for attempt in 1..=self.config.revoke_max_attempts {
            match self.credentials.revoke(handle).await {
                Ok(()) => return true,
                Err(e) if attempt == self.config.revoke_max_attempts => {
                    error!(error = %e, attempt, "Backend revocation retries exhausted");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Backend revocation failed, retrying");
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    tokio::time::sleep(delay + StdDuration::from_millis(jitter)).await;
                    delay = (delay * 2).min(self.config.revoke_retry_cap);
                }
            }
        }

        false
    }

    async fn load(&self, lease_id: Uuid) -> Result<LeaseRecord, LeaseError> {
        self.backend
            .get_lease(lease_id)
            .await?
            .ok_or_else(|| LeaseError::NotFound(lease_id.to_string()))
    }
}

fn actor_of(principal: &Principal) -> Actor {
    Actor {
        actor_type: principal.actor_type.clone(),
        id: principal.entity_id.clone(),
    }
}

//! Server-initiated notifications.
//!
//! Engines publish into the hub; each session task subscribes and
//! forwards the notices addressed to its entity (or to everyone).

use tokio::sync::broadcast;

use crate::error::SessionError;
use crate::proto::{
    kinds, CertExpiringNotice, Frame, LeaseRevokedNotice, PolicyUpdatedNotice,
    SecretRotatedNotice,
};

/// A server-initiated notification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A secret gained a new version.
    SecretRotated {
        /// Rotated path.
        path: String,
        /// New current version.
        new_version: i64,
    },
    /// A policy changed.
    PolicyUpdated {
        /// Changed policy name.
        policy_name: String,
    },
    /// A certificate approaches expiry.
    CertExpiring {
        /// Certificate record id.
        cert_id: String,
        /// Expiry, Unix seconds.
        expires_at: i64,
    },
    /// A lease was revoked.
    LeaseRevoked {
        /// Lease id.
        lease_id: String,
        /// `requested` or `expired`.
        reason: String,
    },
}

impl Notification {
    /// Encodes the notification as a correlation-0 frame.
    pub fn to_frame(&self) -> Result<Frame, SessionError> {
        match self {
            Self::SecretRotated { path, new_version } => Frame::new(
                kinds::NOTIFY_SECRET_ROTATED,
                0,
                &SecretRotatedNotice {
                    path: path.clone(),
                    new_version: *new_version,
                },
            ),
            Self::PolicyUpdated { policy_name } => Frame::new(
                kinds::NOTIFY_POLICY_UPDATED,
                0,
                &PolicyUpdatedNotice {
                    policy_name: policy_name.clone(),
                },
            ),
            Self::CertExpiring { cert_id, expires_at } => Frame::new(
                kinds::NOTIFY_CERT_EXPIRING,
                0,
                &CertExpiringNotice {
                    cert_id: cert_id.clone(),
                    expires_at: *expires_at,
                },
            ),
            Self::LeaseRevoked { lease_id, reason } => Frame::new(
                kinds::NOTIFY_LEASE_REVOKED,
                0,
                &LeaseRevokedNotice {
                    lease_id: lease_id.clone(),
                    reason: reason.clone(),
                },
            ),
        }
    }
}

/// A notification with an optional target entity. `None` reaches every
/// session.
#[derive(Debug, Clone)]
pub struct Targeted {
    /// Target entity id, or `None` for broadcast.
    pub entity: Option<String>,
    /// The notification.
    pub notification: Notification,
}

/// Fan-out hub between engines and session tasks.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Targeted>,
}

impl NotificationHub {
    /// Creates a hub.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self { tx }
    }

    /// Publishes a notification. Dropped silently when no session listens.
    pub fn publish(&self, entity: Option<String>, notification: Notification) {
        let _ = self.tx.send(Targeted {
            entity,
            notification,
        });
    }

    /// Subscribes a session task.
    pub fn subscribe(&self) -> broadcast::Receiver<Targeted> {
        self.tx.subscribe()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a targeted notice applies to a session's entity.
pub fn applies_to(targeted: &Targeted, entity_id: &str) -> bool {
    match &targeted.entity {
        None => true,
        Some(target) => target == entity_id,
    }
}

//! Policy document types.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A named right a rule can grant or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Read a secret or lease.
    Read,
    /// Write or rotate a secret.
    Write,
    /// Tombstone a secret.
    Delete,
    /// Renew a lease.
    Renew,
}

/// Whether a policy's matching rules allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    /// Matching rules grant the capability.
    Allow,
    /// Matching rules forbid the capability, overriding any allow.
    Deny,
}

impl PolicyEffect {
    /// Stable string form used in storage columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    /// Parses the storage column form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Contextual conditions on a rule. Every present condition must hold for
/// the rule to match; an absent condition is satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    /// Inclusive UTC hour window `[start, end]`. When `start > end` the
    /// window wraps past midnight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day_utc: Option<(u8, u8)>,

    /// Permitted ISO weekdays, Monday = 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,

    /// The request origin must fall inside at least one CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cidrs: Option<Vec<IpNet>>,

    /// Caller-requested TTL must not exceed this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl_seconds: Option<u64>,
}

impl Conditions {
    /// True when no condition is set.
    pub fn is_empty(&self) -> bool {
        self.time_of_day_utc.is_none()
            && self.days_of_week.is_none()
            && self.source_cidrs.is_none()
            && self.max_ttl_seconds.is_none()
    }
}

/// One rule: a path glob, the capabilities it covers, and conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Segment-aware path glob (`*` one segment, `**` one or more).
    pub path: String,
    /// Capability set the rule covers.
    pub capabilities: BTreeSet<Capability>,
    /// Contextual conditions.
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

/// A named policy: an effect plus its rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy name.
    pub name: String,
    /// Allow or deny.
    pub effect: PolicyEffect,
    /// Rule list.
    pub rules: Vec<PolicyRule>,
}

/// The subject of an evaluation: an authenticated entity with its policy
/// snapshot. `admin` short-circuits evaluation for the root operator.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Entity identifier (e.g. `role:db-agent` or `root`).
    pub entity_id: String,
    /// Actor kind for audit records: `agent`, `app`, `admin` or `system`.
    pub actor_type: String,
    /// Policy names bound to the entity.
    pub policies: Vec<String>,
    /// Whether the entity carries admin capability.
    pub admin: bool,
}

impl Principal {
    /// An admin principal (root operator).
    pub fn admin(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_type: "admin".to_string(),
            policies: Vec::new(),
            admin: true,
        }
    }

    /// An agent principal with a policy snapshot.
    pub fn agent(entity_id: impl Into<String>, policies: Vec<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_type: "agent".to_string(),
            policies,
            admin: false,
        }
    }

    /// An app principal with a policy snapshot.
    pub fn app(entity_id: impl Into<String>, policies: Vec<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_type: "app".to_string(),
            policies,
            admin: false,
        }
    }

    /// The core itself.
    pub fn system(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_type: "system".to_string(),
            policies: Vec::new(),
            admin: true,
        }
    }
}

/// Evaluation context carried with each request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Evaluation instant.
    pub now: DateTime<Utc>,
    /// Request origin, when the transport knows it.
    pub source_ip: Option<IpAddr>,
    /// TTL the caller asked for, when the operation carries one.
    pub requested_ttl_seconds: Option<u64>,
}

impl RequestContext {
    /// Context for the current instant with no origin or TTL.
    pub fn now() -> Self {
        Self {
            now: Utc::now(),
            source_ip: None,
            requested_ttl_seconds: None,
        }
    }
}

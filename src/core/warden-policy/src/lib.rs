//! # Warden Policy
//!
//! Policy engine: path-glob matching with deny precedence and contextual
//! conditions.
//!
//! A policy is a named set of rules and an effect (`allow` or `deny`). A
//! rule matches a path glob, grants a capability set, and may carry
//! conditions (UTC time-of-day window, weekdays, source CIDRs, maximum
//! requested TTL). Evaluation collects the matching rules from every bound
//! policy; a matching deny rule always wins over any allow, and the
//! absence of a matching allow is a deny.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod glob;
pub mod store;
pub mod types;

pub use engine::{evaluate, Decision};
pub use error::PolicyError;
pub use store::PolicyStore;
pub use types::{
    Capability, Conditions, Policy, PolicyEffect, PolicyRule, Principal, RequestContext,
};

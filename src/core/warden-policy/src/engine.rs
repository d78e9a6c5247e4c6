//! Policy evaluation with deny precedence.

use chrono::{Datelike, Timelike};

use crate::glob;
use crate::types::{Capability, Conditions, Policy, PolicyEffect, RequestContext};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Granted by the named allow policy.
    Allow {
        /// Name of the policy whose rule granted the request.
        policy: String,
    },
    /// Refused.
    Deny {
        /// Name of the deny policy, when a deny rule matched.
        policy: Option<String>,
        /// Human-readable refusal reason. Exposed in full only to admin
        /// capability callers.
        reason: String,
    },
}

impl Decision {
    /// True for [`Decision::Allow`].
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Evaluates `capability` on `path` against the bound policies.
///
/// 1. Collect every rule whose glob matches, whose capability set contains
///    the request, and whose conditions hold under `ctx`.
/// 2. Any such rule in a deny policy refuses the request.
/// 3. Otherwise any such rule in an allow policy grants it.
/// 4. Otherwise the request is refused ("no matching allow").
///
/// No bound policies means deny.
pub fn evaluate(
    policies: &[&Policy],
    path: &str,
    capability: Capability,
    ctx: &RequestContext,
) -> Decision {
    let mut allow_hit: Option<&Policy> = None;

    for &policy in policies {
        for rule in &policy.rules {
            if !rule.capabilities.contains(&capability) {
                continue;
            }
            if !glob::matches(&rule.path, path) {
                continue;
            }
            if !conditions_hold(&rule.conditions, ctx) {
                continue;
            }

            match policy.effect {
                PolicyEffect::Deny => {
                    return Decision::Deny {
                        policy: Some(policy.name.clone()),
                        reason: format!("denied by policy {}", policy.name),
                    };
                }
                PolicyEffect::Allow => {
                    allow_hit.get_or_insert(policy);
                }
            }
        }
    }

    match allow_hit {
        Some(policy) => Decision::Allow {
            policy: policy.name.clone(),
        },
        None => Decision::Deny {
            policy: None,
            reason: "no matching allow".to_string(),
        },
    }
}

/// Checks every present condition; absent conditions are satisfied.
fn conditions_hold(conditions: &Conditions, ctx: &RequestContext) -> bool {
    if let Some((start, end)) = conditions.time_of_day_utc {
        let hour = ctx.now.hour() as u8;
        let inside = if start <= end {
            hour >= start && hour <= end
        } else {
            // Window wraps past midnight, e.g. [22, 6].
            hour >= start || hour <= end
        };
        if !inside {
            return false;
        }
    }

    if let Some(days) = &conditions.days_of_week {
        let today = ctx.now.weekday().number_from_monday() as u8;
        if !days.contains(&today) {
            return false;
        }
    }

    if let Some(cidrs) = &conditions.source_cidrs {
        match ctx.source_ip {
            Some(ip) => {
                if !cidrs.iter().any(|net| net.contains(&ip)) {
                    return false;
                }
            }
            // An origin requirement cannot be proven without an origin.
            None => return false,
        }
    }

    if let Some(max_ttl) = conditions.max_ttl_seconds {
        if let Some(requested) = ctx.requested_ttl_seconds {
            if requested > max_ttl {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    use crate::types::PolicyRule;

    fn policy(name: &str, effect: PolicyEffect, path: &str, caps: &[Capability]) -> Policy {
        policy_with_conditions(name, effect, path, caps, Conditions::default())
    }

    fn policy_with_conditions(
        name: &str,
        effect: PolicyEffect,
        path: &str,
        caps: &[Capability],
        conditions: Conditions,
    ) -> Policy {
        Policy {
            name: name.to_string(),
            effect,
            rules: vec![PolicyRule {
                path: path.to_string(),
                capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
                conditions,
            }],
        }
    }

    fn at_hour(hour: u32) -> RequestContext {
        RequestContext {
            // 2026-06-01 is a Monday.
            now: Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).unwrap(),
            source_ip: None,
            requested_ttl_seconds: None,
        }
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let allow_all = policy("allow_all", PolicyEffect::Allow, "**", &[Capability::Read]);
        let deny_prod = policy("deny_prod", PolicyEffect::Deny, "prod/**", &[Capability::Read]);
        let bound = [&allow_all, &deny_prod];

        let decision = evaluate(&bound, "prod/db", Capability::Read, &RequestContext::now());
        assert_eq!(
            decision,
            Decision::Deny {
                policy: Some("deny_prod".to_string()),
                reason: "denied by policy deny_prod".to_string(),
            }
        );

        let decision = evaluate(&bound, "dev/db", Capability::Read, &RequestContext::now());
        assert_eq!(
            decision,
            Decision::Allow {
                policy: "allow_all".to_string()
            }
        );
    }

    #[test]
    fn test_no_policies_denies() {
        let decision = evaluate(&[], "any/path", Capability::Read, &RequestContext::now());
        assert!(!decision.is_allow());
    }

    #[test]
    fn test_capability_mismatch_denies() {
        let read_only = policy("ro", PolicyEffect::Allow, "db/**", &[Capability::Read]);

        let decision = evaluate(
            &[&read_only],
            "db/prod",
            Capability::Write,
            &RequestContext::now(),
        );
        assert!(!decision.is_allow());
    }

    #[test]
    fn test_deny_with_failed_condition_does_not_deny() {
        let allow = policy("allow", PolicyEffect::Allow, "db/**", &[Capability::Read]);
        let night_deny = policy_with_conditions(
            "night_deny",
            PolicyEffect::Deny,
            "db/**",
            &[Capability::Read],
            Conditions {
                time_of_day_utc: Some((22, 6)),
                ..Default::default()
            },
        );

        // Midday: the deny rule's window does not hold, the allow stands.
        let decision = evaluate(&[&allow, &night_deny], "db/prod", Capability::Read, &at_hour(12));
        assert!(decision.is_allow());

        // Night: deny applies.
        let decision = evaluate(&[&allow, &night_deny], "db/prod", Capability::Read, &at_hour(23));
        assert!(!decision.is_allow());
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let allow = policy_with_conditions(
            "night_shift",
            PolicyEffect::Allow,
            "**",
            &[Capability::Read],
            Conditions {
                time_of_day_utc: Some((22, 6)),
                ..Default::default()
            },
        );

        assert!(evaluate(&[&allow], "x", Capability::Read, &at_hour(23)).is_allow());
        assert!(evaluate(&[&allow], "x", Capability::Read, &at_hour(1)).is_allow());
        assert!(!evaluate(&[&allow], "x", Capability::Read, &at_hour(12)).is_allow());
    }

    #[test]
    fn test_days_of_week() {
        let weekdays_only = policy_with_conditions(
            "weekdays",
            PolicyEffect::Allow,
            "**",
            &[Capability::Read],
            Conditions {
                days_of_week: Some(vec![1, 2, 3, 4, 5]),
                ..Default::default()
            },
        );

        // 2026-06-01 is a Monday, 2026-06-06 a Saturday.
        let monday = at_hour(10);
        assert!(evaluate(&[&weekdays_only], "x", Capability::Read, &monday).is_allow());

        let saturday = RequestContext {
            now: Utc.with_ymd_and_hms(2026, 6, 6, 10, 0, 0).unwrap(),
            source_ip: None,
            requested_ttl_seconds: None,
        };
        assert!(!evaluate(&[&weekdays_only], "x", Capability::Read, &saturday).is_allow());
    }

    #[test]
    fn test_source_cidrs() {
        let internal_only = policy_with_conditions(
            "internal",
            PolicyEffect::Allow,
            "**",
            &[Capability::Read],
            Conditions {
                source_cidrs: Some(vec!["10.0.0.0/8".parse().unwrap()]),
                ..Default::default()
            },
        );

        let mut ctx = RequestContext::now();
        ctx.source_ip = Some("10.1.2.3".parse().unwrap());
        assert!(evaluate(&[&internal_only], "x", Capability::Read, &ctx).is_allow());

        ctx.source_ip = Some("192.168.1.1".parse().unwrap());
        assert!(!evaluate(&[&internal_only], "x", Capability::Read, &ctx).is_allow());

        // Origin requirement with unknown origin: not satisfied.
        ctx.source_ip = None;
        assert!(!evaluate(&[&internal_only], "x", Capability::Read, &ctx).is_allow());
    }

    #[test]
    fn test_max_ttl() {
        let capped = policy_with_conditions(
            "short_leases",
            PolicyEffect::Allow,
            "dynamic/**",
            &[Capability::Read],
            Conditions {
                max_ttl_seconds: Some(300),
                ..Default::default()
            },
        );

        let mut ctx = RequestContext::now();
        ctx.requested_ttl_seconds = Some(60);
        assert!(evaluate(&[&capped], "dynamic/db", Capability::Read, &ctx).is_allow());

        ctx.requested_ttl_seconds = Some(3600);
        assert!(!evaluate(&[&capped], "dynamic/db", Capability::Read, &ctx).is_allow());
    }

    #[test]
    fn test_first_matching_allow_reported() {
        let a = policy("a", PolicyEffect::Allow, "**", &[Capability::Read]);
        let b = policy("b", PolicyEffect::Allow, "**", &[Capability::Read]);

        let decision = evaluate(&[&a, &b], "x", Capability::Read, &RequestContext::now());
        assert_eq!(
            decision,
            Decision::Allow {
                policy: "a".to_string()
            }
        );
    }
}

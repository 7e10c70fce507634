//! MFA enforcement and policy coverage checks
//!
//! Coverage is derived from the tenant Security Defaults state and from
//! enabled conditional-access policies granting MFA. Security Defaults
//! enforce MFA outright for admins but only prompt registration for
//! members, which is why they yield full coverage for the former and
//! partial for the latter. Policies scoped to a subset of applications
//! yield partial coverage.

use super::IdentityFacts;
use crate::connectors::SECURITY_DEFAULTS_EXTERNAL_ID;
use crate::context::AnalysisContext;
use crate::events::Finding;
use crate::types::{AnalysisType, Entity, Severity};
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Coverage {
    None,
    Partial,
    Full,
}

pub(crate) fn security_defaults_enabled(context: &AnalysisContext) -> bool {
    context
        .policies
        .iter()
        .find(|p| p.external_id == SECURITY_DEFAULTS_EXTERNAL_ID)
        .map(|p| p.normalized_data["enabled"].as_bool().unwrap_or(false))
        .unwrap_or(false)
}

/// External ids of every group the identity reaches, for matching against
/// policy include/exclude group lists.
fn expanded_group_externals(context: &AnalysisContext, identity: &Entity) -> HashSet<String> {
    context
        .expanded_groups(&identity.id)
        .into_iter()
        .filter_map(|group_id| {
            context
                .by_id
                .get(&group_id)
                .map(|g| g.external_id.clone())
        })
        .collect()
}

fn str_set<'a>(normalized: &'a serde_json::Value, key: &str) -> Vec<&'a str> {
    normalized[key]
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default()
}

/// Does an enabled conditional-access policy apply to this identity?
fn policy_applies(
    policy: &Entity,
    identity: &Entity,
    group_externals: &HashSet<String>,
) -> bool {
    let normalized = &policy.normalized_data;
    if normalized["policy_kind"].as_str() != Some("conditional_access") {
        return false;
    }
    if normalized["state"].as_str() != Some("enabled") {
        return false;
    }

    let include_users = str_set(normalized, "include_users");
    let include_groups = str_set(normalized, "include_groups");
    let included = include_users.contains(&"All")
        || include_users.contains(&identity.external_id.as_str())
        || include_groups.iter().any(|g| group_externals.contains(*g));
    if !included {
        return false;
    }

    let exclude_users = str_set(normalized, "exclude_users");
    let exclude_groups = str_set(normalized, "exclude_groups");
    let excluded = exclude_users.contains(&identity.external_id.as_str())
        || exclude_groups.iter().any(|g| group_externals.contains(*g));
    !excluded
}

fn policy_app_scope_is_full(policy: &Entity) -> bool {
    str_set(&policy.normalized_data, "include_applications").contains(&"All")
}

pub(crate) fn coverage_for(
    context: &AnalysisContext,
    identity: &Entity,
    is_admin: bool,
    security_defaults_enabled: bool,
) -> Coverage {
    let mut coverage = if security_defaults_enabled {
        if is_admin {
            Coverage::Full
        } else {
            Coverage::Partial
        }
    } else {
        Coverage::None
    };

    let group_externals = expanded_group_externals(context, identity);
    for policy in &context.policies {
        if coverage == Coverage::Full {
            break;
        }
        if !policy.normalized_data["mfa_required"].as_bool().unwrap_or(false) {
            continue;
        }
        if !policy_applies(policy, identity, &group_externals) {
            continue;
        }
        let this = if policy_app_scope_is_full(policy) {
            Coverage::Full
        } else {
            Coverage::Partial
        };
        coverage = coverage.max(this);
    }
    coverage
}

/// Covered by at least one enabled conditional-access policy of any kind,
/// independent of its grant controls. Feeds the policy gap check.
pub(crate) fn covered_by_any_enabled_policy(context: &AnalysisContext, identity: &Entity) -> bool {
    let group_externals = expanded_group_externals(context, identity);
    context
        .policies
        .iter()
        .any(|policy| policy_applies(policy, identity, &group_externals))
}

pub(crate) fn mfa_finding(facts: &IdentityFacts<'_>) -> Option<Finding> {
    if !facts.enabled {
        return None;
    }
    let display_name = facts.entity.normalized_data["display_name"]
        .as_str()
        .unwrap_or(&facts.entity.external_id);
    match facts.coverage {
        Coverage::Full => None,
        Coverage::None => Some(Finding {
            analysis_type: AnalysisType::Mfa,
            entity_id: facts.entity.id.clone(),
            severity: if facts.is_admin {
                Severity::Critical
            } else {
                Severity::High
            },
            fingerprint: format!("mfa_not_enforced:{}", facts.entity.id),
            message: format!("MFA is not enforced for {}", display_name),
            metadata: json!({
                "finding": "mfa_not_enforced",
                "admin": facts.is_admin,
                "user_principal_name": facts.entity.normalized_data["user_principal_name"],
            }),
        }),
        Coverage::Partial => Some(Finding {
            analysis_type: AnalysisType::Mfa,
            entity_id: facts.entity.id.clone(),
            severity: if facts.is_admin {
                Severity::High
            } else {
                Severity::Medium
            },
            fingerprint: format!("mfa_partial_enforced:{}", facts.entity.id),
            message: format!("MFA is only partially enforced for {}", display_name),
            metadata: json!({
                "finding": "mfa_partial_enforced",
                "admin": facts.is_admin,
                "user_principal_name": facts.entity.normalized_data["user_principal_name"],
            }),
        }),
    }
}

pub(crate) fn policy_gap_finding(
    facts: &IdentityFacts<'_>,
    security_defaults_enabled: bool,
) -> Option<Finding> {
    if !facts.enabled || !facts.is_admin || facts.policy_covered || security_defaults_enabled {
        return None;
    }
    let display_name = facts.entity.normalized_data["display_name"]
        .as_str()
        .unwrap_or(&facts.entity.external_id);
    Some(Finding {
        analysis_type: AnalysisType::PolicyGap,
        entity_id: facts.entity.id.clone(),
        severity: Severity::High,
        fingerprint: format!("policy_gap:{}", facts.entity.id),
        message: format!(
            "Admin {} is not covered by any conditional access policy",
            display_name
        ),
        metadata: json!({
            "finding": "policy_gap",
            "admin": true,
        }),
    })
}

//! Account and license hygiene checks
//!
//! Stale accounts, licenses held by disabled or stale identities, and
//! oversubscribed license pools.

use super::IdentityFacts;
use crate::catalog;
use crate::context::AnalysisContext;
use crate::events::Finding;
use crate::types::{AnalysisType, Severity};
use serde_json::json;

pub(crate) fn stale_user_finding(facts: &IdentityFacts<'_>, now: i64) -> Option<Finding> {
    if !facts.stale {
        return None;
    }
    let severity = if facts.is_admin {
        Severity::High
    } else if !facts.license_ids.is_empty() {
        Severity::Medium
    } else {
        Severity::Low
    };
    let display_name = facts.entity.normalized_data["display_name"]
        .as_str()
        .unwrap_or(&facts.entity.external_id);
    let last_login_at = facts.entity.normalized_data["last_login_at"].as_i64();
    Some(Finding {
        analysis_type: AnalysisType::StaleUser,
        entity_id: facts.entity.id.clone(),
        severity,
        fingerprint: format!("stale_user:{}", facts.entity.id),
        message: format!("{} has not signed in for over 90 days", display_name),
        metadata: json!({
            "finding": "stale_user",
            "admin": facts.is_admin,
            "last_login_at": last_login_at,
            "idle_days": last_login_at.map(|t| (now - t) / 86_400_000),
        }),
    })
}

/// One finding per `(identity, license)` held by a disabled or stale
/// identity. A disabled holder is the stronger signal.
pub(crate) fn license_waste_findings(
    context: &AnalysisContext,
    facts: &IdentityFacts<'_>,
) -> Vec<Finding> {
    let disabled = !facts.enabled;
    if !disabled && !facts.stale {
        return Vec::new();
    }
    let display_name = facts.entity.normalized_data["display_name"]
        .as_str()
        .unwrap_or(&facts.entity.external_id);
    let mut findings = Vec::new();
    for license_id in &facts.license_ids {
        let Some(license) = context.by_id.get(license_id) else {
            continue;
        };
        let sku_id = license.external_id.clone();
        let sku_name = license.normalized_data["sku_part_number"]
            .as_str()
            .map(catalog::friendly_name)
            .unwrap_or_else(|| sku_id.clone());
        findings.push(Finding {
            analysis_type: AnalysisType::LicenseWaste,
            entity_id: facts.entity.id.clone(),
            severity: if disabled {
                Severity::Medium
            } else {
                Severity::Low
            },
            fingerprint: format!("license_waste:{}:{}", facts.entity.id, sku_id),
            message: if disabled {
                format!("Disabled account {} still holds {}", display_name, sku_name)
            } else {
                format!("Stale account {} still holds {}", display_name, sku_name)
            },
            metadata: json!({
                "finding": "license_waste",
                "license_entity_id": license_id,
                "sku_id": sku_id,
                "sku_name": sku_name,
                "holder_disabled": disabled,
                "holder_stale": facts.stale,
            }),
        });
    }
    findings
}

/// A license pool consuming more units than it owns. A zero-unit pool is
/// only overused once something actually consumes from it.
pub(crate) fn license_overuse_findings(context: &AnalysisContext) -> Vec<Finding> {
    let mut findings = Vec::new();
    for license in &context.licenses {
        let total = license.normalized_data["total_units"].as_i64().unwrap_or(0);
        let consumed = license.normalized_data["consumed_units"].as_i64().unwrap_or(0);
        if consumed <= total {
            continue;
        }
        let sku_name = license.normalized_data["sku_part_number"]
            .as_str()
            .map(catalog::friendly_name)
            .unwrap_or_else(|| license.external_id.clone());
        findings.push(Finding {
            analysis_type: AnalysisType::LicenseOveruse,
            entity_id: license.id.clone(),
            severity: Severity::High,
            fingerprint: format!("license_overuse:{}", license.id),
            message: format!(
                "{} is oversubscribed: {} of {} units consumed",
                sku_name, consumed, total
            ),
            metadata: json!({
                "finding": "license_overuse",
                "sku_id": license.external_id,
                "total_units": total,
                "consumed_units": consumed,
            }),
        });
    }
    findings
}

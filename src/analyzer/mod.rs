//! Unified posture analyzer
//!
//! Runs every posture check for one data source in a single pass over a
//! loaded context and emits one `analysis.unified` event. The event names
//! the analysis types that ran so the alert manager can resolve stale alerts
//! whose family produced nothing this run. Given the same context, the
//! findings, severities, and fingerprints are identical across runs.

mod hygiene;
mod mfa;

pub use mfa::Coverage;

use crate::context::AnalysisContext;
use crate::events::{AnalysisRunStats, Finding, TagEdit, UnifiedAnalysisEvent};
use crate::types::{now_ms, AnalysisType, Entity};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::debug;

pub const TAG_ADMIN: &str = "Admin";
pub const TAG_NO_MFA: &str = "No MFA";
pub const TAG_PARTIAL_MFA: &str = "Partial MFA";
pub const TAG_STALE: &str = "Stale";

/// Tags owned by the analyzer; anything else on an entity is left alone.
const MANAGED_TAGS: [&str; 4] = [TAG_ADMIN, TAG_NO_MFA, TAG_PARTIAL_MFA, TAG_STALE];

/// Per-identity facts shared by all checks, derived once.
pub(crate) struct IdentityFacts<'a> {
    pub entity: &'a Entity,
    pub enabled: bool,
    pub is_admin: bool,
    pub stale: bool,
    pub coverage: Coverage,
    /// Covered by at least one enabled conditional-access policy of any kind.
    pub policy_covered: bool,
    pub license_ids: Vec<String>,
}

pub struct UnifiedAnalyzer {
    /// An enabled identity with no sign-in for this long is stale.
    stale_after_ms: i64,
}

impl UnifiedAnalyzer {
    pub fn new() -> Self {
        Self {
            stale_after_ms: 90 * 24 * 60 * 60 * 1000,
        }
    }

    /// One full pass. Pure over the context and `now`, which keeps reruns
    /// deterministic and testable.
    pub fn run(
        &self,
        context: &AnalysisContext,
        sync_id: &str,
        analysis_types: &[AnalysisType],
        now: i64,
    ) -> UnifiedAnalysisEvent {
        let started = Instant::now();
        let mut findings: BTreeMap<String, Vec<Finding>> = analysis_types
            .iter()
            .map(|t| (t.as_str().to_string(), Vec::new()))
            .collect();
        let mut tag_edits = Vec::new();

        let security_defaults_enabled = mfa::security_defaults_enabled(context);

        for identity in &context.identities {
            let facts = self.identity_facts(context, identity, security_defaults_enabled, now);

            if analysis_types.contains(&AnalysisType::Mfa) {
                if let Some(finding) = mfa::mfa_finding(&facts) {
                    findings.get_mut(AnalysisType::Mfa.as_str()).map(|v| v.push(finding));
                }
            }
            if analysis_types.contains(&AnalysisType::PolicyGap) {
                if let Some(finding) = mfa::policy_gap_finding(&facts, security_defaults_enabled) {
                    findings
                        .get_mut(AnalysisType::PolicyGap.as_str())
                        .map(|v| v.push(finding));
                }
            }
            if analysis_types.contains(&AnalysisType::StaleUser) {
                if let Some(finding) = hygiene::stale_user_finding(&facts, now) {
                    findings
                        .get_mut(AnalysisType::StaleUser.as_str())
                        .map(|v| v.push(finding));
                }
            }
            if analysis_types.contains(&AnalysisType::LicenseWaste) {
                for finding in hygiene::license_waste_findings(context, &facts) {
                    findings
                        .get_mut(AnalysisType::LicenseWaste.as_str())
                        .map(|v| v.push(finding));
                }
            }

            tag_edits.extend(self.tag_edit(identity, &facts));
        }

        if analysis_types.contains(&AnalysisType::LicenseOveruse) {
            for finding in hygiene::license_overuse_findings(context) {
                findings
                    .get_mut(AnalysisType::LicenseOveruse.as_str())
                    .map(|v| v.push(finding));
            }
        }

        for list in findings.values_mut() {
            list.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        }
        let findings_total = findings.values().map(|v| v.len()).sum();

        debug!(
            data_source_id = %context.data_source_id,
            identities = context.identities.len(),
            findings = findings_total,
            "unified analysis complete"
        );

        UnifiedAnalysisEvent {
            sync_id: sync_id.to_string(),
            tenant_id: context.tenant_id.clone(),
            data_source_id: context.data_source_id.clone(),
            integration_slug: context.integration_slug.clone(),
            analysis_types: analysis_types.to_vec(),
            findings,
            tag_edits,
            entity_counts: context.entity_counts(),
            stats: AnalysisRunStats {
                duration_ms: started.elapsed().as_millis() as i64,
                query_count: context.metrics.query_count,
                slow_query_count: context.metrics.slow_query_count,
                identities_analyzed: context.identities.len(),
                findings_total,
            },
        }
    }

    fn identity_facts<'a>(
        &self,
        context: &AnalysisContext,
        identity: &'a Entity,
        security_defaults_enabled: bool,
        now: i64,
    ) -> IdentityFacts<'a> {
        let enabled = identity.normalized_data["enabled"].as_bool().unwrap_or(false);
        let is_admin = self.is_admin(context, identity);
        let stale = enabled
            && identity.normalized_data["last_login_at"]
                .as_i64()
                .map(|last| last < now - self.stale_after_ms)
                .unwrap_or(false);
        let coverage = mfa::coverage_for(context, identity, is_admin, security_defaults_enabled);
        let policy_covered = mfa::covered_by_any_enabled_policy(context, identity);
        let license_ids = context
            .identity_licenses
            .get(&identity.id)
            .cloned()
            .unwrap_or_default();
        IdentityFacts {
            entity: identity,
            enabled,
            is_admin,
            stale,
            coverage,
            policy_covered,
            license_ids,
        }
    }

    /// Admin status comes from assigned roles whose name contains `admin`.
    fn is_admin(&self, context: &AnalysisContext, identity: &Entity) -> bool {
        context
            .identity_roles
            .get(&identity.id)
            .into_iter()
            .flatten()
            .filter_map(|role_id| context.by_id.get(role_id))
            .any(|role| {
                role.normalized_data["display_name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .contains("admin")
            })
    }

    /// Diff the analyzer-managed tags against what the entity carries.
    fn tag_edit(&self, identity: &Entity, facts: &IdentityFacts<'_>) -> Option<TagEdit> {
        let mut desired: HashSet<&str> = HashSet::new();
        if facts.is_admin {
            desired.insert(TAG_ADMIN);
        }
        if facts.enabled {
            match facts.coverage {
                Coverage::None => {
                    desired.insert(TAG_NO_MFA);
                }
                Coverage::Partial => {
                    desired.insert(TAG_PARTIAL_MFA);
                }
                Coverage::Full => {}
            }
        }
        if facts.stale {
            desired.insert(TAG_STALE);
        }

        let current: HashSet<&str> = identity.tags.iter().map(|t| t.as_str()).collect();
        let mut tags_to_add: Vec<String> = desired
            .iter()
            .filter(|t| !current.contains(*t))
            .map(|t| t.to_string())
            .collect();
        let mut tags_to_remove: Vec<String> = MANAGED_TAGS
            .iter()
            .filter(|t| current.contains(*t) && !desired.contains(*t))
            .map(|t| t.to_string())
            .collect();
        if tags_to_add.is_empty() && tags_to_remove.is_empty() {
            return None;
        }
        tags_to_add.sort();
        tags_to_remove.sort();
        Some(TagEdit {
            entity_id: identity.id.clone(),
            tags_to_add,
            tags_to_remove,
        })
    }
}

impl Default for UnifiedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper for components that always run the full set.
pub fn run_all(context: &AnalysisContext, sync_id: &str) -> UnifiedAnalysisEvent {
    UnifiedAnalyzer::new().run(context, sync_id, &AnalysisType::all(), now_ms())
}

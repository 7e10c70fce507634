//! Alert manager
//!
//! Reconciles one unified analysis run against the alert store. Findings
//! create or refresh alerts by fingerprint; active alerts whose analysis
//! family ran but produced nothing are resolved; suppressions expire back to
//! active before matching. After reconciliation each affected entity's state
//! is recomputed as the maximum severity of its active alerts, and the
//! analyzer's tag edits are applied.
//!
//! The runtime serializes runs per `(data source, analysis types)` scope; a
//! second event for the same scope queues behind the first. All alert writes
//! for one run are committed in a single keyed batch, idempotent under
//! replay.

use crate::error::Result;
use crate::events::UnifiedAnalysisEvent;
use crate::repository::{AlertIndex, AlertStore, EntityStore, SharedRepository};
use crate::types::{now_ms, AlertStatus, EntityAlert, EntityState};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub refreshed: usize,
    pub resolved: usize,
    pub reactivated: usize,
    pub unsuppressed: usize,
    pub entities_touched: usize,
}

pub struct AlertManager {
    repo: SharedRepository,
}

impl AlertManager {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    pub async fn handle_analysis(&self, event: &UnifiedAnalysisEvent) -> Result<ReconcileOutcome> {
        let now = now_ms();
        let mut outcome = ReconcileOutcome::default();
        let mut writes: HashMap<String, EntityAlert> = HashMap::new();

        // Scope: every non-resolved alert whose family ran this round.
        let mut by_fingerprint: HashMap<String, EntityAlert> = HashMap::new();
        for analysis_type in &event.analysis_types {
            for alert in self
                .repo
                .list_alerts(AlertIndex::ByDataSourceStatusType {
                    data_source_id: &event.data_source_id,
                    status: AlertStatus::Active,
                    alert_type: *analysis_type,
                })
                .await?
            {
                by_fingerprint.insert(alert.fingerprint.clone(), alert);
            }
            for mut alert in self
                .repo
                .list_alerts(AlertIndex::ByDataSourceStatusType {
                    data_source_id: &event.data_source_id,
                    status: AlertStatus::Suppressed,
                    alert_type: *analysis_type,
                })
                .await?
            {
                // Expired suppressions rejoin the active pool before matching.
                if matches!(alert.suppressed_until, Some(until) if until <= now) {
                    alert.status = AlertStatus::Active;
                    alert.suppressed_at = None;
                    alert.suppressed_until = None;
                    alert.updated_at = now;
                    outcome.unsuppressed += 1;
                    writes.insert(alert.id.clone(), alert.clone());
                }
                by_fingerprint.insert(alert.fingerprint.clone(), alert);
            }
        }

        let mut seen_fingerprints: HashSet<String> = HashSet::new();
        for finding in event.all_findings() {
            seen_fingerprints.insert(finding.fingerprint.clone());
            if let Some(existing) = by_fingerprint.get(&finding.fingerprint) {
                let mut alert = writes
                    .get(&existing.id)
                    .cloned()
                    .unwrap_or_else(|| existing.clone());
                alert.severity = finding.severity;
                alert.message = finding.message.clone();
                alert.metadata = finding.metadata.clone();
                alert.last_seen_at = now;
                alert.updated_at = now;
                writes.insert(alert.id.clone(), alert);
                outcome.refreshed += 1;
                continue;
            }

            // No live alert. A previously resolved row with the same
            // fingerprint is re-activated instead of duplicated.
            let resolved_match = self
                .repo
                .list_alerts(AlertIndex::ByFingerprint {
                    data_source_id: &event.data_source_id,
                    fingerprint: &finding.fingerprint,
                })
                .await?
                .into_iter()
                .find(|a| a.status == AlertStatus::Resolved && a.deleted_at.is_none());
            if let Some(mut alert) = resolved_match {
                alert.status = AlertStatus::Active;
                alert.resolved_at = None;
                alert.severity = finding.severity;
                alert.message = finding.message.clone();
                alert.metadata = finding.metadata.clone();
                alert.last_seen_at = now;
                alert.updated_at = now;
                writes.insert(alert.id.clone(), alert);
                outcome.reactivated += 1;
                continue;
            }

            let alert = EntityAlert {
                id: Uuid::new_v4().to_string(),
                tenant_id: event.tenant_id.clone(),
                data_source_id: event.data_source_id.clone(),
                entity_id: finding.entity_id.clone(),
                alert_type: finding.analysis_type,
                severity: finding.severity,
                status: AlertStatus::Active,
                fingerprint: finding.fingerprint.clone(),
                message: finding.message.clone(),
                metadata: finding.metadata.clone(),
                created_at: now,
                last_seen_at: now,
                resolved_at: None,
                suppressed_at: None,
                suppressed_until: None,
                updated_at: now,
                deleted_at: None,
            };
            writes.insert(alert.id.clone(), alert);
            outcome.created += 1;
        }

        // Explicit resolution: only alerts of families that actually ran and
        // only when their fingerprint is absent from this run's findings.
        for alert in by_fingerprint.values() {
            if seen_fingerprints.contains(&alert.fingerprint) {
                continue;
            }
            let mut alert = writes
                .get(&alert.id)
                .cloned()
                .unwrap_or_else(|| alert.clone());
            if alert.status != AlertStatus::Active {
                continue;
            }
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
            alert.updated_at = now;
            writes.insert(alert.id.clone(), alert);
            outcome.resolved += 1;
        }

        let batch: Vec<EntityAlert> = writes.values().cloned().collect();
        if !batch.is_empty() {
            self.repo.upsert_alerts(&batch).await?;
        }

        outcome.entities_touched = self.commit_entity_state(event, &batch).await?;

        info!(
            data_source_id = %event.data_source_id,
            created = outcome.created,
            refreshed = outcome.refreshed,
            resolved = outcome.resolved,
            "alert reconciliation complete"
        );
        Ok(outcome)
    }

    /// Apply tag edits and recompute entity state from live alerts.
    async fn commit_entity_state(
        &self,
        event: &UnifiedAnalysisEvent,
        batch: &[EntityAlert],
    ) -> Result<usize> {
        let now = now_ms();
        let mut affected: HashSet<String> = batch.iter().map(|a| a.entity_id.clone()).collect();
        let tag_edits: HashMap<&str, &crate::events::TagEdit> = event
            .tag_edits
            .iter()
            .map(|e| (e.entity_id.as_str(), e))
            .collect();
        affected.extend(tag_edits.keys().map(|k| k.to_string()));

        let mut touched = 0;
        for entity_id in affected {
            let Some(mut entity) = self.repo.get_entity(&entity_id).await? else {
                continue;
            };

            let active = self
                .repo
                .list_alerts(AlertIndex::ByEntityStatus {
                    entity_id: &entity_id,
                    status: AlertStatus::Active,
                })
                .await?;
            let state = active
                .iter()
                .filter(|a| a.deleted_at.is_none())
                .map(|a| a.severity)
                .max()
                .map(|s| s.entity_state())
                .unwrap_or(EntityState::Normal);

            let mut tags = entity.tags.clone();
            if let Some(edit) = tag_edits.get(entity_id.as_str()) {
                tags.retain(|t| !edit.tags_to_remove.contains(t));
                for tag in &edit.tags_to_add {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
                tags.sort();
            }

            if entity.state != state || entity.tags != tags {
                entity.state = state;
                entity.tags = tags;
                entity.updated_at = now;
                self.repo.upsert_entity(&entity).await?;
                touched += 1;
                debug!(entity_id = %entity.id, state = ?entity.state, "entity state committed");
            }
        }
        Ok(touched)
    }
}

//! Retention janitor
//!
//! Hard-purges rows that were soft-deleted more than the retention window
//! ago. Resolved alerts have no `deleted_at` of their own; once one has
//! been quiet for the full window it is aged into the soft-deleted pool
//! with `deleted_at` backdated to its last update, so alert retention is
//! always 90 days from `updated_at`. Runs as an operator command, not as
//! part of the pipeline.

use crate::error::Result;
use crate::repository::{
    AlertIndex, AlertStore, EntityStore, RelationshipStore, SharedRepository, TenantStore,
};
use crate::types::{now_ms, AlertStatus, Severity, RETENTION_MS};
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct JanitorOutcome {
    pub entities_purged: usize,
    pub relationships_purged: usize,
    pub alerts_purged: usize,
    pub alerts_aged_out: usize,
}

pub struct Janitor {
    repo: SharedRepository,
}

impl Janitor {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    pub async fn run(&self) -> Result<JanitorOutcome> {
        self.run_at(now_ms()).await
    }

    pub async fn run_at(&self, now: i64) -> Result<JanitorOutcome> {
        let cutoff = now - RETENTION_MS;
        let mut outcome = JanitorOutcome::default();

        // Resolved alerts quiet for the full window join the soft-deleted
        // pool first. `deleted_at` is backdated to the last update so the
        // purge below removes them in this same pass: an alert is gone 90
        // days after its last update, never later.
        for tenant in self.repo.list_tenants().await? {
            for severity in [
                Severity::Low,
                Severity::Medium,
                Severity::High,
                Severity::Critical,
            ] {
                let resolved = self
                    .repo
                    .list_alerts(AlertIndex::ByTenantStatusSeverity {
                        tenant_id: &tenant.id,
                        status: AlertStatus::Resolved,
                        severity,
                    })
                    .await?;
                for mut alert in resolved {
                    if alert.deleted_at.is_none() && alert.updated_at <= cutoff {
                        alert.deleted_at = Some(alert.updated_at);
                        self.repo.upsert_alert(&alert).await?;
                        outcome.alerts_aged_out += 1;
                    }
                }
            }
        }

        outcome.entities_purged = self.repo.purge_entities_deleted_before(cutoff).await?;
        outcome.relationships_purged = self.repo.purge_relationships_deleted_before(cutoff).await?;
        outcome.alerts_purged = self.repo.purge_alerts_deleted_before(cutoff).await?;

        info!(
            entities = outcome.entities_purged,
            relationships = outcome.relationships_purged,
            alerts = outcome.alerts_purged,
            aged_out = outcome.alerts_aged_out,
            "janitor pass complete"
        );
        Ok(outcome)
    }
}

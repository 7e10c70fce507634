//! Sync job scheduler
//!
//! For every active, non-expired data source and each entity type its
//! integration supports, ensures exactly one pending sync job exists, rate
//! limited per type and deduplicated against both the job table and the
//! queue. Also owns the retry pass that re-pends failed jobs once their
//! backoff elapses.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::events::{sync_queue, SyncJobPayload};
use crate::fabric::{EnqueueOptions, SharedWorkQueue, WorkQueue};
use crate::repository::{
    DataSourceStore, IntegrationStore, JobIndex, JobStore, SharedRepository, TenantStore,
};
use crate::types::{
    now_ms, DataSource, DataSourceStatus, Integration, JobStatus, ScheduledJob, SupportedType,
    TenantStatus,
};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exponential backoff for a failed job: `min(30s * 2^attempts, 15min)`.
pub fn backoff_ms(config: &PipelineConfig, attempts: u32) -> i64 {
    let factor = 1_i64.checked_shl(attempts.min(20)).unwrap_or(i64::MAX);
    config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms)
}

/// Backoff plus up to one second of jitter so retries from many jobs do not
/// land on the same instant.
pub fn backoff_with_jitter(config: &PipelineConfig, attempts: u32) -> i64 {
    backoff_ms(config, attempts) + rand::thread_rng().gen_range(0..1_000)
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerTickStats {
    pub jobs_created: usize,
    pub jobs_requeued: usize,
    pub retries_pended: usize,
    pub sources_errored: usize,
    pub skipped_at_limit: usize,
}

pub struct Scheduler {
    repo: SharedRepository,
    queue: SharedWorkQueue,
    config: PipelineConfig,
}

impl Scheduler {
    pub fn new(repo: SharedRepository, queue: SharedWorkQueue, config: PipelineConfig) -> Self {
        Self { repo, queue, config }
    }

    /// One scheduling pass over every data source.
    pub async fn tick(&self) -> Result<SchedulerTickStats> {
        let now = now_ms();
        let mut stats = SchedulerTickStats::default();

        // Retries first, so a failed-and-due job is back to pending before
        // the ensure pass looks for one.
        stats.retries_pended = self.pend_due_retries(now).await?;

        let tenants: HashMap<String, _> = self
            .repo
            .list_tenants()
            .await?
            .into_iter()
            .filter(|t| t.status == TenantStatus::Active && t.deleted_at.is_none())
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut integrations: HashMap<String, Integration> = HashMap::new();
        for data_source in self.repo.list_data_sources().await? {
            if data_source.deleted_at.is_some() {
                continue;
            }
            let Some(tenant) = tenants.get(&data_source.tenant_id) else {
                continue;
            };
            if data_source.status != DataSourceStatus::Active {
                continue;
            }
            if data_source.credential_expired(now) {
                self.mark_credentials_expired(&data_source, now).await?;
                stats.sources_errored += 1;
                continue;
            }

            if self.tenant_running_count(&data_source.tenant_id).await?
                >= tenant.concurrent_job_limit
            {
                debug!(
                    tenant_id = %tenant.id,
                    limit = tenant.concurrent_job_limit,
                    "tenant at concurrent job limit, deferring dispatch"
                );
                stats.skipped_at_limit += 1;
                continue;
            }

            let integration = match integrations.get(&data_source.integration_id) {
                Some(integration) => integration.clone(),
                None => match self.repo.get_integration(&data_source.integration_id).await? {
                    Some(integration) => {
                        integrations
                            .insert(data_source.integration_id.clone(), integration.clone());
                        integration
                    }
                    None => {
                        warn!(
                            data_source_id = %data_source.id,
                            integration_id = %data_source.integration_id,
                            "data source references unknown integration"
                        );
                        continue;
                    }
                },
            };

            for supported in &integration.supported_types {
                match self
                    .ensure_sync_job(&data_source, &integration, supported, now)
                    .await?
                {
                    EnsureOutcome::Created => stats.jobs_created += 1,
                    EnsureOutcome::Requeued => stats.jobs_requeued += 1,
                    EnsureOutcome::AlreadyPending => {}
                }
            }
        }

        if stats.jobs_created > 0 || stats.retries_pended > 0 {
            info!(
                created = stats.jobs_created,
                retried = stats.retries_pended,
                "scheduler tick complete"
            );
        }
        Ok(stats)
    }

    /// Ensure one pending sync job exists for `(data_source, entity type)`.
    /// Used by both the tick and the adapter's end-of-sync self-schedule.
    pub async fn ensure_sync_job(
        &self,
        data_source: &DataSource,
        integration: &Integration,
        supported: &SupportedType,
        now: i64,
    ) -> Result<EnsureOutcome> {
        let action = supported.entity_type.sync_action();
        let queue_name = sync_queue(&integration.slug, supported.entity_type);

        if self
            .queue
            .has_pending_for(&queue_name, &data_source.id, &action)
            .await?
        {
            return Ok(EnsureOutcome::AlreadyPending);
        }

        // A pending row without a queue message means we crashed between the
        // insert and the enqueue; re-enqueue it instead of duplicating.
        let pending = self
            .repo
            .list_jobs(JobIndex::ByDataSourceStatus {
                data_source_id: &data_source.id,
                status: JobStatus::Pending,
            })
            .await?;
        if let Some(existing) = pending.into_iter().find(|j| j.action == action) {
            self.enqueue_job(&existing, &queue_name, now).await?;
            return Ok(EnsureOutcome::Requeued);
        }

        let next_allowed = data_source
            .last_success_at
            .get(supported.entity_type.as_str())
            .map(|last| last + supported.rate_minutes * 60_000)
            .unwrap_or(0);
        let scheduled_at = now.max(next_allowed);

        let sync_id = Uuid::new_v4().to_string();
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            tenant_id: data_source.tenant_id.clone(),
            integration_id: integration.id.clone(),
            integration_slug: integration.slug.clone(),
            data_source_id: data_source.id.clone(),
            action: action.clone(),
            payload: serde_json::to_value(SyncJobPayload {
                sync_id,
                job_id: String::new(),
                tenant_id: data_source.tenant_id.clone(),
                integration_slug: integration.slug.clone(),
                integration_id: integration.id.clone(),
                data_source_id: data_source.id.clone(),
                action: action.clone(),
                entity_type: supported.entity_type,
                priority: supported.priority,
                cursor: None,
                batch_number: 0,
                started_at: scheduled_at,
            })?,
            priority: supported.priority,
            status: JobStatus::Pending,
            attempts: 0,
            attempts_max: self.config.attempts_max,
            scheduled_at,
            started_at: None,
            next_retry_at: None,
            error: None,
            updated_at: now,
            deleted_at: None,
        };
        // The payload carries its own job id so the adapter can transition
        // the row without a secondary lookup.
        let mut job = job;
        job.payload["job_id"] = serde_json::Value::String(job.id.clone());
        self.repo.upsert_job(&job).await?;
        self.enqueue_job(&job, &queue_name, now).await?;
        Ok(EnsureOutcome::Created)
    }

    async fn enqueue_job(&self, job: &ScheduledJob, queue_name: &str, now: i64) -> Result<()> {
        self.queue
            .enqueue(
                queue_name,
                job.payload.clone(),
                EnqueueOptions {
                    priority: job.priority,
                    delay_ms: (job.scheduled_at - now).max(0),
                    data_source_id: Some(job.data_source_id.clone()),
                    action: Some(job.action.clone()),
                },
            )
            .await?;
        Ok(())
    }

    /// Flip failed jobs whose backoff has elapsed back to pending and
    /// re-enqueue them.
    async fn pend_due_retries(&self, now: i64) -> Result<usize> {
        let due = self
            .repo
            .list_jobs(JobIndex::ByPendingDue {
                due_at_or_before: now,
            })
            .await?;
        let mut pended = 0;
        for mut job in due {
            if job.status != JobStatus::Failed {
                continue;
            }
            if job.attempts >= job.attempts_max {
                job.status = JobStatus::Broken;
                job.updated_at = now;
                self.repo.upsert_job(&job).await?;
                warn!(job_id = %job.id, action = %job.action, "job retry budget exhausted, marking broken");
                continue;
            }
            job.status = JobStatus::Pending;
            job.next_retry_at = None;
            job.scheduled_at = now;
            job.updated_at = now;
            self.repo.upsert_job(&job).await?;
            let queue_name = sync_queue(
                &job.integration_slug,
                crate::types::EntityType::parse(
                    job.action.strip_prefix("sync.").unwrap_or_default(),
                )
                .unwrap_or(crate::types::EntityType::Identities),
            );
            if !self
                .queue
                .has_pending_for(&queue_name, &job.data_source_id, &job.action)
                .await?
            {
                self.enqueue_job(&job, &queue_name, now).await?;
            }
            pended += 1;
        }
        Ok(pended)
    }

    async fn tenant_running_count(&self, tenant_id: &str) -> Result<usize> {
        let mut running = 0;
        for data_source in self.repo.list_data_sources_by_tenant(tenant_id).await? {
            running += self
                .repo
                .list_jobs(JobIndex::ByDataSourceStatus {
                    data_source_id: &data_source.id,
                    status: JobStatus::Running,
                })
                .await?
                .len();
        }
        Ok(running)
    }

    async fn mark_credentials_expired(&self, data_source: &DataSource, now: i64) -> Result<()> {
        let mut updated = data_source.clone();
        updated.status = DataSourceStatus::Error;
        updated.last_error = Some("credential_expired".to_string());
        updated.updated_at = now;
        self.repo.upsert_data_source(&updated).await?;
        warn!(
            data_source_id = %data_source.id,
            tenant_id = %data_source.tenant_id,
            "credentials expired, data source moved to error"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Requeued,
    AlreadyPending,
}

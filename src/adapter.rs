//! Adapter runtime
//!
//! Drives one connector call per sync job message: health check, typed
//! fetch, fingerprinting, site resolution, and the `fetched.*` publish.
//! Paginated fetches re-enqueue the next batch under the same sync id; the
//! final batch completes the job and self-schedules the next sync.

use crate::config::PipelineConfig;
use crate::connectors::{ConnectorErrorKind, SharedRegistry};
use crate::error::{PostureError, Result};
use crate::events::{fetched_topic, sync_queue, FetchedEvent, FetchedRecord, SyncJobPayload};
use crate::fabric::{
    EnqueueOptions, QueueMessage, SharedTopicBus, SharedWorkQueue, TopicBus, WorkQueue,
};
use crate::hashing::data_hash;
use crate::repository::{DataSourceStore, IntegrationStore, JobStore, SharedRepository};
use crate::scheduler::{backoff_with_jitter, Scheduler};
use crate::types::{
    now_ms, DataSource, DataSourceStatus, DomainMapping, EntityType, JobStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AdapterRuntime {
    repo: SharedRepository,
    queue: SharedWorkQueue,
    bus: SharedTopicBus,
    registry: SharedRegistry,
    scheduler: Arc<Scheduler>,
    config: PipelineConfig,
}

impl AdapterRuntime {
    pub fn new(
        repo: SharedRepository,
        queue: SharedWorkQueue,
        bus: SharedTopicBus,
        registry: SharedRegistry,
        scheduler: Arc<Scheduler>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            bus,
            registry,
            scheduler,
            config,
        }
    }

    /// Handle one sync queue message. Retry bookkeeping happens in the job
    /// table, so this always consumes the message.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<()> {
        let payload: SyncJobPayload = serde_json::from_value(message.payload.clone())?;
        let Some(mut data_source) = self.repo.get_data_source(&payload.data_source_id).await? else {
            warn!(data_source_id = %payload.data_source_id, "sync job for missing data source, dropping");
            return Ok(());
        };

        if payload.batch_number == 0 {
            if !self.repo.claim_job(&payload.job_id, now_ms()).await? {
                debug!(job_id = %payload.job_id, "job already claimed or superseded, dropping");
                return Ok(());
            }
            data_source.current_sync_id = Some(payload.sync_id.clone());
            data_source.updated_at = now_ms();
            self.repo.upsert_data_source(&data_source).await?;
        } else {
            // Continuation batches only run while their sync is current.
            let job = self.repo.get_job(&payload.job_id).await?;
            let running = matches!(&job, Some(j) if j.status == JobStatus::Running);
            let current = data_source.current_sync_id.as_deref() == Some(&payload.sync_id);
            if !running || !current {
                debug!(
                    job_id = %payload.job_id,
                    sync_id = %payload.sync_id,
                    "continuation batch for superseded sync, dropping"
                );
                return Ok(());
            }
        }

        match self.run_batch(&payload, &data_source).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.handle_failure(&payload, &data_source, err).await?;
                Ok(())
            }
        }
    }

    async fn run_batch(&self, payload: &SyncJobPayload, data_source: &DataSource) -> Result<()> {
        let connector = self.registry.connector_for(data_source)?;

        if payload.batch_number == 0 {
            connector.check_health().await.map_err(PostureError::from)?;
        }

        let page = connector
            .fetch(
                payload.entity_type,
                payload.cursor.as_deref(),
                &data_source.config,
            )
            .await
            .map_err(PostureError::from)?;

        let mut records = Vec::with_capacity(page.records.len());
        for raw in &page.records {
            if raw.external_id.is_empty() {
                warn!(
                    data_source_id = %data_source.id,
                    entity_type = %payload.entity_type.as_str(),
                    "skipping record with empty external id"
                );
                continue;
            }
            let site_id = if payload.entity_type == EntityType::Identities {
                resolve_site(
                    raw.normalized_data["user_principal_name"]
                        .as_str()
                        .unwrap_or_default(),
                    &data_source.config.domain_mappings,
                )
            } else {
                None
            };
            records.push(FetchedRecord {
                external_id: raw.external_id.clone(),
                data_hash: data_hash(payload.entity_type, &raw.raw_data),
                raw_data: raw.raw_data.clone(),
                normalized_data: raw.normalized_data.clone(),
                site_id: site_id.or_else(|| data_source.site_id.clone()),
            });
        }

        let record_count = records.len();
        let event = FetchedEvent {
            sync_id: payload.sync_id.clone(),
            tenant_id: payload.tenant_id.clone(),
            data_source_id: data_source.id.clone(),
            integration_id: payload.integration_id.clone(),
            integration_slug: payload.integration_slug.clone(),
            entity_type: payload.entity_type,
            records,
            has_more: page.has_more,
            cursor: page.cursor.clone(),
        };
        self.bus
            .publish(
                &fetched_topic(payload.entity_type),
                serde_json::to_value(&event)?,
            )
            .await?;
        debug!(
            sync_id = %payload.sync_id,
            batch = payload.batch_number,
            records = record_count,
            "published fetched batch"
        );

        if page.has_more {
            let mut next = payload.clone();
            next.cursor = page.cursor;
            next.batch_number = payload.batch_number + 1;
            self.queue
                .enqueue(
                    &sync_queue(&payload.integration_slug, payload.entity_type),
                    serde_json::to_value(&next)?,
                    EnqueueOptions {
                        priority: payload.priority,
                        delay_ms: 0,
                        data_source_id: Some(data_source.id.clone()),
                        action: Some(payload.action.clone()),
                    },
                )
                .await?;
            return Ok(());
        }

        self.complete_sync(payload, data_source).await
    }

    async fn complete_sync(&self, payload: &SyncJobPayload, data_source: &DataSource) -> Result<()> {
        let now = now_ms();
        if let Some(mut job) = self.repo.get_job(&payload.job_id).await? {
            job.status = JobStatus::Completed;
            job.error = None;
            job.updated_at = now;
            self.repo.upsert_job(&job).await?;
        }

        let mut updated = match self.repo.get_data_source(&data_source.id).await? {
            Some(ds) => ds,
            None => data_source.clone(),
        };
        updated
            .last_success_at
            .insert(payload.entity_type.as_str().to_string(), now);
        updated.last_sync_at = Some(now);
        updated.current_sync_id = None;
        updated.last_error = None;
        updated.updated_at = now;
        self.repo.upsert_data_source(&updated).await?;

        info!(
            sync_id = %payload.sync_id,
            data_source_id = %data_source.id,
            entity_type = %payload.entity_type.as_str(),
            "sync completed"
        );

        // Self-schedule the next run; the ensure path dedupes.
        if let Some(integration) = self.repo.get_integration(&payload.integration_id).await? {
            if let Some(supported) = integration.supported_type(payload.entity_type) {
                self.scheduler
                    .ensure_sync_job(&updated, &integration, supported, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        payload: &SyncJobPayload,
        data_source: &DataSource,
        err: PostureError,
    ) -> Result<()> {
        let now = now_ms();
        let kind = match &err {
            PostureError::Connector { class, .. } => match class {
                crate::error::ErrorClass::Credential => ConnectorErrorKind::Credential,
                crate::error::ErrorClass::Transient => ConnectorErrorKind::Transient,
                _ => ConnectorErrorKind::Permanent,
            },
            e if e.is_retryable() => ConnectorErrorKind::Transient,
            _ => ConnectorErrorKind::Permanent,
        };

        let Some(mut job) = self.repo.get_job(&payload.job_id).await? else {
            return Ok(());
        };
        job.attempts += 1;
        job.error = Some(err.to_string());
        job.updated_at = now;

        match kind {
            ConnectorErrorKind::Credential => {
                job.status = JobStatus::Failed;
                job.next_retry_at = None;
                let mut ds = data_source.clone();
                ds.status = DataSourceStatus::Error;
                ds.last_error = Some(err.to_string());
                ds.current_sync_id = None;
                ds.updated_at = now;
                self.repo.upsert_data_source(&ds).await?;
                warn!(
                    data_source_id = %data_source.id,
                    error = %err,
                    "credential failure, data source moved to error"
                );
            }
            ConnectorErrorKind::Transient => {
                if job.attempts >= job.attempts_max {
                    job.status = JobStatus::Broken;
                    job.next_retry_at = None;
                    warn!(job_id = %job.id, error = %err, "retry budget exhausted, job broken");
                } else {
                    job.status = JobStatus::Failed;
                    job.next_retry_at = Some(now + backoff_with_jitter(&self.config, job.attempts));
                    debug!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        "transient failure, retry scheduled"
                    );
                }
            }
            ConnectorErrorKind::Permanent => {
                job.status = JobStatus::Failed;
                job.next_retry_at = None;
                warn!(job_id = %job.id, error = %err, "permanent failure, job failed");
            }
        }
        self.repo.upsert_job(&job).await?;
        Ok(())
    }
}

/// Longest-suffix match of a user principal name against the configured
/// domain mappings. An identity under two mapped domains lands on the site
/// of the longest match. The suffix must start at a label boundary, so a
/// mapping for `contoso.com` matches `mail.contoso.com` but never
/// `fakecontoso.com`.
pub fn resolve_site(user_principal_name: &str, mappings: &[DomainMapping]) -> Option<String> {
    if user_principal_name.is_empty() {
        return None;
    }
    let upn = user_principal_name.to_ascii_lowercase();
    mappings
        .iter()
        .filter(|m| domain_matches(&upn, &m.domain.to_ascii_lowercase()))
        .max_by_key(|m| m.domain.len())
        .map(|m| m.site_id.clone())
}

fn domain_matches(upn: &str, domain: &str) -> bool {
    if domain.is_empty() || upn.len() <= domain.len() || !upn.ends_with(domain) {
        return false;
    }
    matches!(
        upn.as_bytes()[upn.len() - domain.len() - 1],
        b'@' | b'.'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(domain: &str, site_id: &str) -> DomainMapping {
        DomainMapping {
            domain: domain.to_string(),
            site_id: site_id.to_string(),
        }
    }

    #[test]
    fn longest_suffix_wins() {
        let mappings = vec![
            mapping("contoso.com", "site-root"),
            mapping("mail.contoso.com", "site-mail"),
        ];
        assert_eq!(
            resolve_site("alice@mail.contoso.com", &mappings),
            Some("site-mail".to_string())
        );
        assert_eq!(
            resolve_site("bob@contoso.com", &mappings),
            Some("site-root".to_string())
        );
        assert_eq!(resolve_site("carol@fabrikam.com", &mappings), None);
        assert_eq!(resolve_site("", &mappings), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mappings = vec![mapping("Contoso.com", "site-1")];
        assert_eq!(
            resolve_site("Alice@CONTOSO.COM", &mappings),
            Some("site-1".to_string())
        );
    }

    #[test]
    fn suffix_match_respects_label_boundaries() {
        let mappings = vec![mapping("contoso.com", "site-1")];
        // An unrelated domain sharing a raw string suffix must not match.
        assert_eq!(resolve_site("alice@fakecontoso.com", &mappings), None);
        // A real subdomain still does.
        assert_eq!(
            resolve_site("alice@mail.contoso.com", &mappings),
            Some("site-1".to_string())
        );
        assert_eq!(
            resolve_site("alice@contoso.com", &mappings),
            Some("site-1".to_string())
        );
    }
}

//! Repository interface over the durable document store
//!
//! Typed CRUD plus indexed list per collection. Every list goes through a
//! named index with equality-prefix parameters; there is no way to express a
//! full scan through this interface. Writes are atomic per record and batched
//! writes are keyed upserts, idempotent under retry.
//!
//! The durable store itself is an external collaborator. The in-memory
//! backend in [`memory`] implements the same contract for single-process
//! deployments and tests.

pub mod memory;

use crate::error::Result;
use crate::types::{
    Agent, AlertStatus, AnalysisType, DataSource, Entity, EntityAlert, EntityRelationship,
    EntityType, Integration, JobStatus, RelationshipType, ScheduledJob, Severity, Site, Tenant,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Named indexes over the entities collection.
#[derive(Debug, Clone)]
pub enum EntityIndex<'a> {
    ByTenant { tenant_id: &'a str },
    ByDataSource { data_source_id: &'a str },
    ByDataSourceType { data_source_id: &'a str, entity_type: EntityType },
    BySiteType { site_id: &'a str, entity_type: EntityType },
    ByExternalId { data_source_id: &'a str, external_id: &'a str },
    BySyncId { data_source_id: &'a str, entity_type: EntityType, sync_id: &'a str },
}

/// Named indexes over the relationships collection.
#[derive(Debug, Clone)]
pub enum RelationshipIndex<'a> {
    ByParent { parent_entity_id: &'a str },
    ByParentType { parent_entity_id: &'a str, relationship_type: RelationshipType },
    ByChildType { child_entity_id: &'a str, relationship_type: RelationshipType },
    ByDataSourceType { data_source_id: &'a str, relationship_type: RelationshipType },
}

/// Named indexes over the alerts collection.
#[derive(Debug, Clone)]
pub enum AlertIndex<'a> {
    ByEntityStatus { entity_id: &'a str, status: AlertStatus },
    ByFingerprint { data_source_id: &'a str, fingerprint: &'a str },
    ByDataSourceStatusType {
        data_source_id: &'a str,
        status: AlertStatus,
        alert_type: AnalysisType,
    },
    ByTenantStatusSeverity {
        tenant_id: &'a str,
        status: AlertStatus,
        severity: Severity,
    },
}

/// Named indexes over the scheduled jobs collection.
#[derive(Debug, Clone)]
pub enum JobIndex<'a> {
    ByDataSourceStatus { data_source_id: &'a str, status: JobStatus },
    /// Pending or retryable jobs due at or before the given time.
    ByPendingDue { due_at_or_before: i64 },
    /// Pending jobs ordered by priority (desc) then scheduled_at (asc).
    ByPriorityAndScheduledAt,
}

/// Named indexes over the agents collection.
#[derive(Debug, Clone)]
pub enum AgentIndex<'a> {
    ByTenant { tenant_id: &'a str },
    ByGuid { guid: &'a str },
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>>;
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<String>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;
}

#[async_trait]
pub trait SiteStore: Send + Sync {
    async fn get_site(&self, id: &str) -> Result<Option<Site>>;
    async fn upsert_site(&self, site: &Site) -> Result<String>;
    async fn list_sites_by_tenant(&self, tenant_id: &str) -> Result<Vec<Site>>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get_integration(&self, id: &str) -> Result<Option<Integration>>;
    async fn get_integration_by_slug(&self, slug: &str) -> Result<Option<Integration>>;
    async fn upsert_integration(&self, integration: &Integration) -> Result<String>;
    async fn list_integrations(&self) -> Result<Vec<Integration>>;
}

#[async_trait]
pub trait DataSourceStore: Send + Sync {
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>>;
    async fn upsert_data_source(&self, data_source: &DataSource) -> Result<String>;
    async fn list_data_sources(&self) -> Result<Vec<DataSource>>;
    async fn list_data_sources_by_tenant(&self, tenant_id: &str) -> Result<Vec<DataSource>>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;
    async fn upsert_entity(&self, entity: &Entity) -> Result<String>;
    /// Keyed batch upsert; replaying the same batch is a no-op.
    async fn upsert_entities(&self, entities: &[Entity]) -> Result<usize>;
    async fn list_entities(&self, index: EntityIndex<'_>) -> Result<Vec<Entity>>;
    /// Hard-delete rows soft-deleted at or before the cutoff. Janitor only.
    async fn purge_entities_deleted_before(&self, cutoff: i64) -> Result<usize>;
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn get_relationship(&self, id: &str) -> Result<Option<EntityRelationship>>;
    async fn upsert_relationship(&self, relationship: &EntityRelationship) -> Result<String>;
    async fn upsert_relationships(&self, relationships: &[EntityRelationship]) -> Result<usize>;
    async fn list_relationships(
        &self,
        index: RelationshipIndex<'_>,
    ) -> Result<Vec<EntityRelationship>>;
    async fn purge_relationships_deleted_before(&self, cutoff: i64) -> Result<usize>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_alert(&self, id: &str) -> Result<Option<EntityAlert>>;
    async fn upsert_alert(&self, alert: &EntityAlert) -> Result<String>;
    /// One-batch commit for an analysis run, keyed by alert id.
    async fn upsert_alerts(&self, alerts: &[EntityAlert]) -> Result<usize>;
    async fn list_alerts(&self, index: AlertIndex<'_>) -> Result<Vec<EntityAlert>>;
    async fn purge_alerts_deleted_before(&self, cutoff: i64) -> Result<usize>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>>;
    async fn upsert_job(&self, job: &ScheduledJob) -> Result<String>;
    async fn list_jobs(&self, index: JobIndex<'_>) -> Result<Vec<ScheduledJob>>;
    /// Compare-and-set transition pending -> running. Returns false when the
    /// job was already claimed, completed, or rescheduled.
    async fn claim_job(&self, id: &str, now: i64) -> Result<bool>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn upsert_agent(&self, agent: &Agent) -> Result<String>;
    async fn list_agents(&self, index: AgentIndex<'_>) -> Result<Vec<Agent>>;
    async fn list_all_agents(&self) -> Result<Vec<Agent>>;
    /// Batched agent update; returns the ids that failed so callers can retry
    /// them on the next cycle.
    async fn batch_update_agents(&self, agents: &[Agent]) -> Result<Vec<String>>;
}

/// Aggregate repository surface the pipeline components are constructed over.
#[async_trait]
pub trait Repository:
    TenantStore
    + SiteStore
    + IntegrationStore
    + DataSourceStore
    + EntityStore
    + RelationshipStore
    + AlertStore
    + JobStore
    + AgentStore
{
    /// Validate or build the required secondary indexes (`migrate`).
    async fn ensure_indexes(&self) -> Result<()>;
    async fn health_check(&self) -> Result<bool>;
}

pub type SharedRepository = Arc<dyn Repository>;

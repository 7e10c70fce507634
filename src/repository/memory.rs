//! In-memory repository backend
//!
//! Implements the full store contract with real secondary index maps so the
//! indexed-list guarantees hold the same way they do against the durable
//! store. This is the default backend for development and testing and for
//! single-process deployments.

use super::*;
use crate::error::PostureError;
use crate::types::*;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

const IDX_ENTITY_BY_TENANT: &str = "by_tenant";
const IDX_ENTITY_BY_DATA_SOURCE: &str = "by_data_source";
const IDX_ENTITY_BY_DATA_SOURCE_TYPE: &str = "by_data_source_type";
const IDX_ENTITY_BY_SITE_TYPE: &str = "by_site_type";
const IDX_ENTITY_BY_EXTERNAL_ID: &str = "by_external_id";
const IDX_ENTITY_BY_SYNC_ID: &str = "by_sync_id";

const IDX_REL_BY_PARENT: &str = "by_parent";
const IDX_REL_BY_PARENT_TYPE: &str = "by_parent_type";
const IDX_REL_BY_CHILD_TYPE: &str = "by_child_type";
const IDX_REL_BY_DATA_SOURCE_TYPE: &str = "by_data_source_type";

const IDX_ALERT_BY_ENTITY_STATUS: &str = "by_entity_status";
const IDX_ALERT_BY_FINGERPRINT: &str = "by_fingerprint";
const IDX_ALERT_BY_DS_STATUS_TYPE: &str = "by_data_source_status_type";
const IDX_ALERT_BY_TENANT_STATUS_SEVERITY: &str = "by_tenant_status_severity";

const IDX_JOB_BY_DATA_SOURCE_STATUS: &str = "by_data_source_status";
const IDX_JOB_BY_PENDING_DUE: &str = "by_pending_due";
const IDX_JOB_BY_PRIORITY_SCHEDULED: &str = "by_priority_and_scheduled_at";

const IDX_BY_TENANT: &str = "by_tenant";
const IDX_AGENT_BY_GUID: &str = "by_guid";

fn join2(a: &str, b: &str) -> String {
    format!("{}|{}", a, b)
}

fn join3(a: &str, b: &str, c: &str) -> String {
    format!("{}|{}|{}", a, b, c)
}

fn alert_status_str(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Active => "active",
        AlertStatus::Resolved => "resolved",
        AlertStatus::Suppressed => "suppressed",
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Broken => "broken",
    }
}

/// One collection with its secondary index maps. Index maintenance happens
/// inside the collection's write lock, so every upsert is atomic.
struct Table<T: Clone> {
    collection: &'static str,
    rows: IndexMap<String, T>,
    indexes: HashMap<&'static str, BTreeMap<String, BTreeSet<String>>>,
    key_fn: fn(&T) -> Vec<(&'static str, String)>,
}

impl<T: Clone> Table<T> {
    fn new(
        collection: &'static str,
        index_names: &[&'static str],
        key_fn: fn(&T) -> Vec<(&'static str, String)>,
    ) -> Self {
        let mut indexes = HashMap::new();
        for name in index_names {
            indexes.insert(*name, BTreeMap::new());
        }
        Self {
            collection,
            rows: IndexMap::new(),
            indexes,
            key_fn,
        }
    }

    fn upsert(&mut self, id: String, row: T) {
        if let Some(existing) = self.rows.get(&id) {
            for (index, key) in (self.key_fn)(existing) {
                if let Some(bucket) = self.indexes.get_mut(index).and_then(|m| m.get_mut(&key)) {
                    bucket.remove(&id);
                }
            }
        }
        for (index, key) in (self.key_fn)(&row) {
            self.indexes
                .entry(index)
                .or_default()
                .entry(key)
                .or_default()
                .insert(id.clone());
        }
        self.rows.insert(id, row);
    }

    fn remove(&mut self, id: &str) -> Option<T> {
        let row = self.rows.shift_remove(id)?;
        for (index, key) in (self.key_fn)(&row) {
            if let Some(bucket) = self.indexes.get_mut(index).and_then(|m| m.get_mut(&key)) {
                bucket.remove(id);
            }
        }
        Some(row)
    }

    fn get(&self, id: &str) -> Option<T> {
        self.rows.get(id).cloned()
    }

    fn lookup(&self, index: &'static str, key: &str) -> crate::error::Result<Vec<T>> {
        let map = self
            .indexes
            .get(index)
            .ok_or_else(|| PostureError::UnknownIndex {
                collection: self.collection.to_string(),
                index: index.to_string(),
            })?;
        Ok(map
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.rows.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn all(&self) -> Vec<T> {
        self.rows.values().cloned().collect()
    }
}

fn entity_keys(e: &Entity) -> Vec<(&'static str, String)> {
    let mut keys = vec![
        (IDX_ENTITY_BY_TENANT, e.tenant_id.clone()),
        (IDX_ENTITY_BY_DATA_SOURCE, e.data_source_id.clone()),
        (
            IDX_ENTITY_BY_DATA_SOURCE_TYPE,
            join2(&e.data_source_id, e.entity_type.as_str()),
        ),
        (
            IDX_ENTITY_BY_EXTERNAL_ID,
            join2(&e.data_source_id, &e.external_id),
        ),
        (
            IDX_ENTITY_BY_SYNC_ID,
            join3(&e.data_source_id, e.entity_type.as_str(), &e.sync_id),
        ),
    ];
    if let Some(site_id) = &e.site_id {
        keys.push((
            IDX_ENTITY_BY_SITE_TYPE,
            join2(site_id, e.entity_type.as_str()),
        ));
    }
    keys
}

fn relationship_keys(r: &EntityRelationship) -> Vec<(&'static str, String)> {
    vec![
        (IDX_REL_BY_PARENT, r.parent_entity_id.clone()),
        (
            IDX_REL_BY_PARENT_TYPE,
            join2(&r.parent_entity_id, r.relationship_type.as_str()),
        ),
        (
            IDX_REL_BY_CHILD_TYPE,
            join2(&r.child_entity_id, r.relationship_type.as_str()),
        ),
        (
            IDX_REL_BY_DATA_SOURCE_TYPE,
            join2(&r.data_source_id, r.relationship_type.as_str()),
        ),
    ]
}

fn alert_keys(a: &EntityAlert) -> Vec<(&'static str, String)> {
    vec![
        (
            IDX_ALERT_BY_ENTITY_STATUS,
            join2(&a.entity_id, alert_status_str(a.status)),
        ),
        (
            IDX_ALERT_BY_FINGERPRINT,
            join2(&a.data_source_id, &a.fingerprint),
        ),
        (
            IDX_ALERT_BY_DS_STATUS_TYPE,
            join3(
                &a.data_source_id,
                alert_status_str(a.status),
                a.alert_type.as_str(),
            ),
        ),
        (
            IDX_ALERT_BY_TENANT_STATUS_SEVERITY,
            join3(
                &a.tenant_id,
                alert_status_str(a.status),
                a.severity.as_str(),
            ),
        ),
    ]
}

fn job_keys(j: &ScheduledJob) -> Vec<(&'static str, String)> {
    let mut keys = vec![(
        IDX_JOB_BY_DATA_SOURCE_STATUS,
        join2(&j.data_source_id, job_status_str(j.status)),
    )];
    match j.status {
        JobStatus::Pending => {
            keys.push((IDX_JOB_BY_PENDING_DUE, "due".to_string()));
            keys.push((IDX_JOB_BY_PRIORITY_SCHEDULED, "pending".to_string()));
        }
        JobStatus::Failed if j.next_retry_at.is_some() => {
            keys.push((IDX_JOB_BY_PENDING_DUE, "due".to_string()));
        }
        _ => {}
    }
    keys
}

fn agent_keys(a: &Agent) -> Vec<(&'static str, String)> {
    vec![
        (IDX_BY_TENANT, a.tenant_id.clone()),
        (IDX_AGENT_BY_GUID, a.guid.clone()),
    ]
}

/// In-memory repository. Collections are independent locks, matching the
/// per-record atomic write guarantee of the store contract.
pub struct MemoryRepository {
    tenants: RwLock<Table<Tenant>>,
    sites: RwLock<Table<Site>>,
    integrations: RwLock<Table<Integration>>,
    data_sources: RwLock<Table<DataSource>>,
    entities: RwLock<Table<Entity>>,
    relationships: RwLock<Table<EntityRelationship>>,
    alerts: RwLock<Table<EntityAlert>>,
    jobs: RwLock<Table<ScheduledJob>>,
    agents: RwLock<Table<Agent>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(Table::new("tenants", &[], |_| Vec::new())),
            sites: RwLock::new(Table::new("sites", &[IDX_BY_TENANT], |s: &Site| {
                vec![(IDX_BY_TENANT, s.tenant_id.clone())]
            })),
            integrations: RwLock::new(Table::new("integrations", &[], |_| Vec::new())),
            data_sources: RwLock::new(Table::new(
                "data_sources",
                &[IDX_BY_TENANT],
                |d: &DataSource| vec![(IDX_BY_TENANT, d.tenant_id.clone())],
            )),
            entities: RwLock::new(Table::new(
                "entities",
                &[
                    IDX_ENTITY_BY_TENANT,
                    IDX_ENTITY_BY_DATA_SOURCE,
                    IDX_ENTITY_BY_DATA_SOURCE_TYPE,
                    IDX_ENTITY_BY_SITE_TYPE,
                    IDX_ENTITY_BY_EXTERNAL_ID,
                    IDX_ENTITY_BY_SYNC_ID,
                ],
                entity_keys,
            )),
            relationships: RwLock::new(Table::new(
                "relationships",
                &[
                    IDX_REL_BY_PARENT,
                    IDX_REL_BY_PARENT_TYPE,
                    IDX_REL_BY_CHILD_TYPE,
                    IDX_REL_BY_DATA_SOURCE_TYPE,
                ],
                relationship_keys,
            )),
            alerts: RwLock::new(Table::new(
                "alerts",
                &[
                    IDX_ALERT_BY_ENTITY_STATUS,
                    IDX_ALERT_BY_FINGERPRINT,
                    IDX_ALERT_BY_DS_STATUS_TYPE,
                    IDX_ALERT_BY_TENANT_STATUS_SEVERITY,
                ],
                alert_keys,
            )),
            jobs: RwLock::new(Table::new(
                "scheduled_jobs",
                &[
                    IDX_JOB_BY_DATA_SOURCE_STATUS,
                    IDX_JOB_BY_PENDING_DUE,
                    IDX_JOB_BY_PRIORITY_SCHEDULED,
                ],
                job_keys,
            )),
            agents: RwLock::new(Table::new(
                "agents",
                &[IDX_BY_TENANT, IDX_AGENT_BY_GUID],
                agent_keys,
            )),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantStore for MemoryRepository {
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().await.get(id))
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<String> {
        self.tenants
            .write()
            .await
            .upsert(tenant.id.clone(), tenant.clone());
        Ok(tenant.id.clone())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.read().await.all())
    }
}

#[async_trait]
impl SiteStore for MemoryRepository {
    async fn get_site(&self, id: &str) -> Result<Option<Site>> {
        Ok(self.sites.read().await.get(id))
    }

    async fn upsert_site(&self, site: &Site) -> Result<String> {
        self.sites.write().await.upsert(site.id.clone(), site.clone());
        Ok(site.id.clone())
    }

    async fn list_sites_by_tenant(&self, tenant_id: &str) -> Result<Vec<Site>> {
        self.sites.read().await.lookup(IDX_BY_TENANT, tenant_id)
    }
}

#[async_trait]
impl IntegrationStore for MemoryRepository {
    async fn get_integration(&self, id: &str) -> Result<Option<Integration>> {
        Ok(self.integrations.read().await.get(id))
    }

    async fn get_integration_by_slug(&self, slug: &str) -> Result<Option<Integration>> {
        Ok(self
            .integrations
            .read()
            .await
            .all()
            .into_iter()
            .find(|i| i.slug == slug))
    }

    async fn upsert_integration(&self, integration: &Integration) -> Result<String> {
        self.integrations
            .write()
            .await
            .upsert(integration.id.clone(), integration.clone());
        Ok(integration.id.clone())
    }

    async fn list_integrations(&self) -> Result<Vec<Integration>> {
        Ok(self.integrations.read().await.all())
    }
}

#[async_trait]
impl DataSourceStore for MemoryRepository {
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.data_sources.read().await.get(id))
    }

    async fn upsert_data_source(&self, data_source: &DataSource) -> Result<String> {
        self.data_sources
            .write()
            .await
            .upsert(data_source.id.clone(), data_source.clone());
        Ok(data_source.id.clone())
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        Ok(self.data_sources.read().await.all())
    }

    async fn list_data_sources_by_tenant(&self, tenant_id: &str) -> Result<Vec<DataSource>> {
        self.data_sources
            .read()
            .await
            .lookup(IDX_BY_TENANT, tenant_id)
    }
}

#[async_trait]
impl EntityStore for MemoryRepository {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.entities.read().await.get(id))
    }

    async fn upsert_entity(&self, entity: &Entity) -> Result<String> {
        self.entities
            .write()
            .await
            .upsert(entity.id.clone(), entity.clone());
        Ok(entity.id.clone())
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<usize> {
        let mut table = self.entities.write().await;
        for entity in entities {
            table.upsert(entity.id.clone(), entity.clone());
        }
        Ok(entities.len())
    }

    async fn list_entities(&self, index: EntityIndex<'_>) -> Result<Vec<Entity>> {
        let table = self.entities.read().await;
        match index {
            EntityIndex::ByTenant { tenant_id } => table.lookup(IDX_ENTITY_BY_TENANT, tenant_id),
            EntityIndex::ByDataSource { data_source_id } => {
                table.lookup(IDX_ENTITY_BY_DATA_SOURCE, data_source_id)
            }
            EntityIndex::ByDataSourceType {
                data_source_id,
                entity_type,
            } => table.lookup(
                IDX_ENTITY_BY_DATA_SOURCE_TYPE,
                &join2(data_source_id, entity_type.as_str()),
            ),
            EntityIndex::BySiteType {
                site_id,
                entity_type,
            } => table.lookup(
                IDX_ENTITY_BY_SITE_TYPE,
                &join2(site_id, entity_type.as_str()),
            ),
            EntityIndex::ByExternalId {
                data_source_id,
                external_id,
            } => table.lookup(
                IDX_ENTITY_BY_EXTERNAL_ID,
                &join2(data_source_id, external_id),
            ),
            EntityIndex::BySyncId {
                data_source_id,
                entity_type,
                sync_id,
            } => table.lookup(
                IDX_ENTITY_BY_SYNC_ID,
                &join3(data_source_id, entity_type.as_str(), sync_id),
            ),
        }
    }

    async fn purge_entities_deleted_before(&self, cutoff: i64) -> Result<usize> {
        let mut table = self.entities.write().await;
        let expired: Vec<String> = table
            .rows
            .iter()
            .filter(|(_, e)| matches!(e.deleted_at, Some(at) if at <= cutoff))
            .map(|(id, _)| id.clone())
            .collect();
        let purged = expired.len();
        for id in expired {
            table.remove(&id);
        }
        Ok(purged)
    }
}

#[async_trait]
impl RelationshipStore for MemoryRepository {
    async fn get_relationship(&self, id: &str) -> Result<Option<EntityRelationship>> {
        Ok(self.relationships.read().await.get(id))
    }

    async fn upsert_relationship(&self, relationship: &EntityRelationship) -> Result<String> {
        self.relationships
            .write()
            .await
            .upsert(relationship.id.clone(), relationship.clone());
        Ok(relationship.id.clone())
    }

    async fn upsert_relationships(&self, relationships: &[EntityRelationship]) -> Result<usize> {
        let mut table = self.relationships.write().await;
        for relationship in relationships {
            table.upsert(relationship.id.clone(), relationship.clone());
        }
        Ok(relationships.len())
    }

    async fn list_relationships(
        &self,
        index: RelationshipIndex<'_>,
    ) -> Result<Vec<EntityRelationship>> {
        let table = self.relationships.read().await;
        match index {
            RelationshipIndex::ByParent { parent_entity_id } => {
                table.lookup(IDX_REL_BY_PARENT, parent_entity_id)
            }
            RelationshipIndex::ByParentType {
                parent_entity_id,
                relationship_type,
            } => table.lookup(
                IDX_REL_BY_PARENT_TYPE,
                &join2(parent_entity_id, relationship_type.as_str()),
            ),
            RelationshipIndex::ByChildType {
                child_entity_id,
                relationship_type,
            } => table.lookup(
                IDX_REL_BY_CHILD_TYPE,
                &join2(child_entity_id, relationship_type.as_str()),
            ),
            RelationshipIndex::ByDataSourceType {
                data_source_id,
                relationship_type,
            } => table.lookup(
                IDX_REL_BY_DATA_SOURCE_TYPE,
                &join2(data_source_id, relationship_type.as_str()),
            ),
        }
    }

    async fn purge_relationships_deleted_before(&self, cutoff: i64) -> Result<usize> {
        let mut table = self.relationships.write().await;
        let expired: Vec<String> = table
            .rows
            .iter()
            .filter(|(_, r)| matches!(r.deleted_at, Some(at) if at <= cutoff))
            .map(|(id, _)| id.clone())
            .collect();
        let purged = expired.len();
        for id in expired {
            table.remove(&id);
        }
        Ok(purged)
    }
}

#[async_trait]
impl AlertStore for MemoryRepository {
    async fn get_alert(&self, id: &str) -> Result<Option<EntityAlert>> {
        Ok(self.alerts.read().await.get(id))
    }

    async fn upsert_alert(&self, alert: &EntityAlert) -> Result<String> {
        self.alerts
            .write()
            .await
            .upsert(alert.id.clone(), alert.clone());
        Ok(alert.id.clone())
    }

    async fn upsert_alerts(&self, alerts: &[EntityAlert]) -> Result<usize> {
        let mut table = self.alerts.write().await;
        for alert in alerts {
            table.upsert(alert.id.clone(), alert.clone());
        }
        Ok(alerts.len())
    }

    async fn list_alerts(&self, index: AlertIndex<'_>) -> Result<Vec<EntityAlert>> {
        let table = self.alerts.read().await;
        match index {
            AlertIndex::ByEntityStatus { entity_id, status } => table.lookup(
                IDX_ALERT_BY_ENTITY_STATUS,
                &join2(entity_id, alert_status_str(status)),
            ),
            AlertIndex::ByFingerprint {
                data_source_id,
                fingerprint,
            } => table.lookup(
                IDX_ALERT_BY_FINGERPRINT,
                &join2(data_source_id, fingerprint),
            ),
            AlertIndex::ByDataSourceStatusType {
                data_source_id,
                status,
                alert_type,
            } => table.lookup(
                IDX_ALERT_BY_DS_STATUS_TYPE,
                &join3(data_source_id, alert_status_str(status), alert_type.as_str()),
            ),
            AlertIndex::ByTenantStatusSeverity {
                tenant_id,
                status,
                severity,
            } => table.lookup(
                IDX_ALERT_BY_TENANT_STATUS_SEVERITY,
                &join3(tenant_id, alert_status_str(status), severity.as_str()),
            ),
        }
    }

    async fn purge_alerts_deleted_before(&self, cutoff: i64) -> Result<usize> {
        let mut table = self.alerts.write().await;
        let expired: Vec<String> = table
            .rows
            .iter()
            .filter(|(_, a)| matches!(a.deleted_at, Some(at) if at <= cutoff))
            .map(|(id, _)| id.clone())
            .collect();
        let purged = expired.len();
        for id in expired {
            table.remove(&id);
        }
        Ok(purged)
    }
}

#[async_trait]
impl JobStore for MemoryRepository {
    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.read().await.get(id))
    }

    async fn upsert_job(&self, job: &ScheduledJob) -> Result<String> {
        self.jobs.write().await.upsert(job.id.clone(), job.clone());
        Ok(job.id.clone())
    }

    async fn list_jobs(&self, index: JobIndex<'_>) -> Result<Vec<ScheduledJob>> {
        let table = self.jobs.read().await;
        match index {
            JobIndex::ByDataSourceStatus {
                data_source_id,
                status,
            } => table.lookup(
                IDX_JOB_BY_DATA_SOURCE_STATUS,
                &join2(data_source_id, job_status_str(status)),
            ),
            JobIndex::ByPendingDue { due_at_or_before } => {
                let mut due: Vec<ScheduledJob> = table
                    .lookup(IDX_JOB_BY_PENDING_DUE, "due")?
                    .into_iter()
                    .filter(|j| match j.status {
                        JobStatus::Pending => j.scheduled_at <= due_at_or_before,
                        JobStatus::Failed => {
                            matches!(j.next_retry_at, Some(at) if at <= due_at_or_before)
                        }
                        _ => false,
                    })
                    .collect();
                due.sort_by_key(|j| j.scheduled_at);
                Ok(due)
            }
            JobIndex::ByPriorityAndScheduledAt => {
                let mut pending = table.lookup(IDX_JOB_BY_PRIORITY_SCHEDULED, "pending")?;
                pending.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.scheduled_at.cmp(&b.scheduled_at))
                });
                Ok(pending)
            }
        }
    }

    async fn claim_job(&self, id: &str, now: i64) -> Result<bool> {
        let mut table = self.jobs.write().await;
        match table.get(id) {
            Some(mut job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.updated_at = now;
                table.upsert(id.to_string(), job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AgentStore for MemoryRepository {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.agents.read().await.get(id))
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<String> {
        self.agents
            .write()
            .await
            .upsert(agent.id.clone(), agent.clone());
        Ok(agent.id.clone())
    }

    async fn list_agents(&self, index: AgentIndex<'_>) -> Result<Vec<Agent>> {
        let table = self.agents.read().await;
        match index {
            AgentIndex::ByTenant { tenant_id } => table.lookup(IDX_BY_TENANT, tenant_id),
            AgentIndex::ByGuid { guid } => table.lookup(IDX_AGENT_BY_GUID, guid),
        }
    }

    async fn list_all_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.all())
    }

    async fn batch_update_agents(&self, agents: &[Agent]) -> Result<Vec<String>> {
        let mut table = self.agents.write().await;
        for agent in agents {
            table.upsert(agent.id.clone(), agent.clone());
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn ensure_indexes(&self) -> Result<()> {
        // Index maps are created at construction; verify the required set is
        // registered so `migrate` fails loudly if a build drops one.
        let required: [(&str, usize); 5] = [
            ("entities", 6),
            ("relationships", 4),
            ("alerts", 4),
            ("scheduled_jobs", 3),
            ("agents", 2),
        ];
        let counts = [
            ("entities", self.entities.read().await.indexes.len()),
            ("relationships", self.relationships.read().await.indexes.len()),
            ("alerts", self.alerts.read().await.indexes.len()),
            ("scheduled_jobs", self.jobs.read().await.indexes.len()),
            ("agents", self.agents.read().await.indexes.len()),
        ];
        for ((collection, expected), (_, actual)) in required.iter().zip(counts.iter()) {
            if actual < expected {
                return Err(PostureError::Store(format!(
                    "collection '{}' is missing indexes: expected {}, found {}",
                    collection, expected, actual
                )));
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, external_id: &str, sync_id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            integration_id: "int-1".to_string(),
            data_source_id: "ds-1".to_string(),
            site_id: Some("site-1".to_string()),
            external_id: external_id.to_string(),
            entity_type: EntityType::Identities,
            state: EntityState::Normal,
            data_hash: "hash".to_string(),
            raw_data: json!({}),
            normalized_data: json!({}),
            tags: Vec::new(),
            sync_id: sync_id.to_string(),
            last_seen_at: 1,
            updated_at: 1,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn entity_indexes_track_upserts() {
        let repo = MemoryRepository::new();
        repo.upsert_entity(&entity("e-1", "ext-1", "sync-1"))
            .await
            .unwrap();
        repo.upsert_entity(&entity("e-2", "ext-2", "sync-1"))
            .await
            .unwrap();

        let by_external = repo
            .list_entities(EntityIndex::ByExternalId {
                data_source_id: "ds-1",
                external_id: "ext-1",
            })
            .await
            .unwrap();
        assert_eq!(by_external.len(), 1);
        assert_eq!(by_external[0].id, "e-1");

        // Re-sync e-1 under a new sync id; the old sync bucket must empty out.
        repo.upsert_entity(&entity("e-1", "ext-1", "sync-2"))
            .await
            .unwrap();
        let old_sync = repo
            .list_entities(EntityIndex::BySyncId {
                data_source_id: "ds-1",
                entity_type: EntityType::Identities,
                sync_id: "sync-1",
            })
            .await
            .unwrap();
        assert_eq!(old_sync.len(), 1);
        assert_eq!(old_sync[0].id, "e-2");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_under_replay() {
        let repo = MemoryRepository::new();
        let e = entity("e-1", "ext-1", "sync-1");
        repo.upsert_entities(std::slice::from_ref(&e)).await.unwrap();
        repo.upsert_entities(std::slice::from_ref(&e)).await.unwrap();
        let rows = repo
            .list_entities(EntityIndex::ByDataSource {
                data_source_id: "ds-1",
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn claim_job_is_a_compare_and_set() {
        let repo = MemoryRepository::new();
        let job = ScheduledJob {
            id: "j-1".to_string(),
            tenant_id: "t-1".to_string(),
            integration_id: "int-1".to_string(),
            integration_slug: "microsoft-365".to_string(),
            data_source_id: "ds-1".to_string(),
            action: "sync.identities".to_string(),
            payload: json!({}),
            priority: 5,
            status: JobStatus::Pending,
            attempts: 0,
            attempts_max: 5,
            scheduled_at: 0,
            started_at: None,
            next_retry_at: None,
            error: None,
            updated_at: 0,
            deleted_at: None,
        };
        repo.upsert_job(&job).await.unwrap();
        assert!(repo.claim_job("j-1", 100).await.unwrap());
        assert!(!repo.claim_job("j-1", 101).await.unwrap());
        let claimed = repo.get_job("j-1").await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.started_at, Some(100));
    }

    #[tokio::test]
    async fn pending_due_index_orders_and_filters() {
        let repo = MemoryRepository::new();
        for (id, scheduled_at) in [("j-1", 200), ("j-2", 50), ("j-3", 500)] {
            let mut job = ScheduledJob {
                id: id.to_string(),
                tenant_id: "t-1".to_string(),
                integration_id: "int-1".to_string(),
                integration_slug: "microsoft-365".to_string(),
                data_source_id: "ds-1".to_string(),
                action: "sync.identities".to_string(),
                payload: json!({}),
                priority: 5,
                status: JobStatus::Pending,
                attempts: 0,
                attempts_max: 5,
                scheduled_at,
                started_at: None,
                next_retry_at: None,
                error: None,
                updated_at: 0,
                deleted_at: None,
            };
            if id == "j-3" {
                job.status = JobStatus::Failed;
                job.next_retry_at = Some(100);
            }
            repo.upsert_job(&job).await.unwrap();
        }
        let due = repo
            .list_jobs(JobIndex::ByPendingDue {
                due_at_or_before: 250,
            })
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["j-2", "j-1", "j-3"]);
    }

    #[tokio::test]
    async fn janitor_purge_only_removes_expired_rows() {
        let repo = MemoryRepository::new();
        let mut live = entity("e-1", "ext-1", "s");
        live.deleted_at = Some(2_000);
        let mut expired = entity("e-2", "ext-2", "s");
        expired.deleted_at = Some(500);
        repo.upsert_entity(&live).await.unwrap();
        repo.upsert_entity(&expired).await.unwrap();

        let purged = repo.purge_entities_deleted_before(1_000).await.unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get_entity("e-2").await.unwrap().is_none());
        assert!(repo.get_entity("e-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migrate_validates_required_indexes() {
        let repo = MemoryRepository::new();
        assert!(repo.ensure_indexes().await.is_ok());
    }
}

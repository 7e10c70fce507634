//! Analysis context loader
//!
//! Loads a coherent snapshot of one data source's entity graph plus the
//! precomputed lookup maps every posture check shares. The load is a bounded
//! number of indexed queries; a sync finishing mid-load is detected through
//! the data source's `current_sync_id` marker and retried once.

use crate::error::{PostureError, Result};
use crate::repository::{
    DataSourceStore, EntityIndex, EntityStore, RelationshipIndex, RelationshipStore,
    SharedRepository,
};
use crate::types::{Entity, EntityType, RelationshipType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, warn};

/// Queries slower than this count against `slow_query_count`.
const SLOW_QUERY_MS: u128 = 500;

/// Nested-group reachability cap for policy targeting and membership
/// expansion. Deep nesting beyond this is treated as unreachable.
pub const GROUP_BFS_DEPTH: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMetrics {
    pub query_count: usize,
    pub load_time_ms: i64,
    pub slow_query_count: usize,
}

/// Snapshot of everything the unified analyzer needs for one scope.
pub struct AnalysisContext {
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_slug: String,

    pub identities: Vec<Entity>,
    pub groups: Vec<Entity>,
    pub roles: Vec<Entity>,
    pub policies: Vec<Entity>,
    pub licenses: Vec<Entity>,

    /// Every loaded entity by id.
    pub by_id: HashMap<String, Entity>,
    /// External id -> entity id across all loaded types.
    pub by_external_id: HashMap<String, String>,

    /// identity id -> directly held group ids.
    pub identity_groups: HashMap<String, Vec<String>>,
    /// group id -> groups it is directly a member of (nested membership).
    pub group_parents: HashMap<String, Vec<String>>,
    /// group id -> direct member ids (identities and groups).
    pub group_members: HashMap<String, Vec<String>>,
    /// identity id -> assigned role ids.
    pub identity_roles: HashMap<String, Vec<String>>,
    /// identity id -> held license ids.
    pub identity_licenses: HashMap<String, Vec<String>>,
    /// license id -> holder identity ids.
    pub license_holders: HashMap<String, Vec<String>>,
    /// role id -> assignee identity ids.
    pub role_assignees: HashMap<String, Vec<String>>,
    /// policy id -> directly targeted entity ids (identities and groups).
    pub policy_targets: HashMap<String, Vec<String>>,

    pub metrics: ContextMetrics,
}

impl AnalysisContext {
    /// All group ids an identity belongs to, directly or through nested
    /// groups, bounded by [`GROUP_BFS_DEPTH`].
    pub fn expanded_groups(&self, identity_id: &str) -> HashSet<String> {
        let mut reached: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> = self
            .identity_groups
            .get(identity_id)
            .into_iter()
            .flatten()
            .map(|g| (g.clone(), 1))
            .collect();
        while let Some((group_id, depth)) = frontier.pop_front() {
            if !reached.insert(group_id.clone()) || depth >= GROUP_BFS_DEPTH {
                continue;
            }
            for parent in self.group_parents.get(&group_id).into_iter().flatten() {
                frontier.push_back((parent.clone(), depth + 1));
            }
        }
        reached
    }

    pub fn entity_counts(&self) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("identities".to_string(), self.identities.len());
        counts.insert("groups".to_string(), self.groups.len());
        counts.insert("roles".to_string(), self.roles.len());
        counts.insert("policies".to_string(), self.policies.len());
        counts.insert("licenses".to_string(), self.licenses.len());
        counts
    }
}

pub struct ContextLoader {
    repo: SharedRepository,
}

impl ContextLoader {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    /// Load the snapshot, retrying once if a sync completes mid-load.
    pub async fn load(
        &self,
        tenant_id: &str,
        data_source_id: &str,
        integration_slug: &str,
    ) -> Result<AnalysisContext> {
        match self.load_once(tenant_id, data_source_id, integration_slug).await {
            Err(PostureError::TornSnapshot(_)) => {
                warn!(data_source_id, "torn snapshot detected, retrying load once");
                self.load_once(tenant_id, data_source_id, integration_slug)
                    .await
            }
            other => other,
        }
    }

    async fn load_once(
        &self,
        tenant_id: &str,
        data_source_id: &str,
        integration_slug: &str,
    ) -> Result<AnalysisContext> {
        let started = Instant::now();
        let mut metrics = ContextMetrics::default();

        let marker_before = self.sync_marker(data_source_id, &mut metrics).await?;

        let identities = self
            .entities(data_source_id, EntityType::Identities, &mut metrics)
            .await?;
        let groups = self
            .entities(data_source_id, EntityType::Groups, &mut metrics)
            .await?;
        let roles = self
            .entities(data_source_id, EntityType::Roles, &mut metrics)
            .await?;
        let policies = self
            .entities(data_source_id, EntityType::Policies, &mut metrics)
            .await?;
        let licenses = self
            .entities(data_source_id, EntityType::Licenses, &mut metrics)
            .await?;

        let member_of = self
            .edges(data_source_id, RelationshipType::MemberOf, &mut metrics)
            .await?;
        let assigned_role = self
            .edges(data_source_id, RelationshipType::AssignedRole, &mut metrics)
            .await?;
        let has_license = self
            .edges(data_source_id, RelationshipType::HasLicense, &mut metrics)
            .await?;
        let applies_to = self
            .edges(data_source_id, RelationshipType::AppliesTo, &mut metrics)
            .await?;

        let marker_after = self.sync_marker(data_source_id, &mut metrics).await?;
        if marker_before != marker_after {
            return Err(PostureError::TornSnapshot(data_source_id.to_string()));
        }

        let mut by_id = HashMap::new();
        let mut by_external_id = HashMap::new();
        for entity in identities
            .iter()
            .chain(&groups)
            .chain(&roles)
            .chain(&policies)
            .chain(&licenses)
        {
            by_id.insert(entity.id.clone(), entity.clone());
            by_external_id.insert(entity.external_id.clone(), entity.id.clone());
        }

        let identity_ids: HashSet<&str> = identities.iter().map(|e| e.id.as_str()).collect();
        let group_ids: HashSet<&str> = groups.iter().map(|e| e.id.as_str()).collect();

        let mut identity_groups: HashMap<String, Vec<String>> = HashMap::new();
        let mut group_parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut group_members: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &member_of {
            if identity_ids.contains(edge.parent_entity_id.as_str()) {
                identity_groups
                    .entry(edge.parent_entity_id.clone())
                    .or_default()
                    .push(edge.child_entity_id.clone());
            } else if group_ids.contains(edge.parent_entity_id.as_str()) {
                group_parents
                    .entry(edge.parent_entity_id.clone())
                    .or_default()
                    .push(edge.child_entity_id.clone());
            }
            group_members
                .entry(edge.child_entity_id.clone())
                .or_default()
                .push(edge.parent_entity_id.clone());
        }

        let mut identity_roles: HashMap<String, Vec<String>> = HashMap::new();
        let mut role_assignees: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &assigned_role {
            identity_roles
                .entry(edge.parent_entity_id.clone())
                .or_default()
                .push(edge.child_entity_id.clone());
            role_assignees
                .entry(edge.child_entity_id.clone())
                .or_default()
                .push(edge.parent_entity_id.clone());
        }

        let mut identity_licenses: HashMap<String, Vec<String>> = HashMap::new();
        let mut license_holders: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &has_license {
            identity_licenses
                .entry(edge.parent_entity_id.clone())
                .or_default()
                .push(edge.child_entity_id.clone());
            license_holders
                .entry(edge.child_entity_id.clone())
                .or_default()
                .push(edge.parent_entity_id.clone());
        }

        let mut policy_targets: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &applies_to {
            policy_targets
                .entry(edge.parent_entity_id.clone())
                .or_default()
                .push(edge.child_entity_id.clone());
        }

        metrics.load_time_ms = started.elapsed().as_millis() as i64;
        debug!(
            data_source_id,
            query_count = metrics.query_count,
            load_time_ms = metrics.load_time_ms,
            "context loaded"
        );

        Ok(AnalysisContext {
            tenant_id: tenant_id.to_string(),
            data_source_id: data_source_id.to_string(),
            integration_slug: integration_slug.to_string(),
            identities,
            groups,
            roles,
            policies,
            licenses,
            by_id,
            by_external_id,
            identity_groups,
            group_parents,
            group_members,
            identity_roles,
            identity_licenses,
            license_holders,
            role_assignees,
            policy_targets,
            metrics,
        })
    }

    async fn sync_marker(
        &self,
        data_source_id: &str,
        metrics: &mut ContextMetrics,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        let data_source = self.repo.get_data_source(data_source_id).await?;
        Self::record(metrics, started);
        Ok(data_source.and_then(|ds| ds.current_sync_id))
    }

    async fn entities(
        &self,
        data_source_id: &str,
        entity_type: EntityType,
        metrics: &mut ContextMetrics,
    ) -> Result<Vec<Entity>> {
        let started = Instant::now();
        let rows = self
            .repo
            .list_entities(EntityIndex::ByDataSourceType {
                data_source_id,
                entity_type,
            })
            .await?;
        Self::record(metrics, started);
        Ok(rows.into_iter().filter(|e| e.deleted_at.is_none()).collect())
    }

    async fn edges(
        &self,
        data_source_id: &str,
        relationship_type: RelationshipType,
        metrics: &mut ContextMetrics,
    ) -> Result<Vec<crate::types::EntityRelationship>> {
        let started = Instant::now();
        let rows = self
            .repo
            .list_relationships(RelationshipIndex::ByDataSourceType {
                data_source_id,
                relationship_type,
            })
            .await?;
        Self::record(metrics, started);
        Ok(rows.into_iter().filter(|r| r.deleted_at.is_none()).collect())
    }

    fn record(metrics: &mut ContextMetrics, started: Instant) {
        metrics.query_count += 1;
        if started.elapsed().as_millis() > SLOW_QUERY_MS {
            metrics.slow_query_count += 1;
        }
    }
}

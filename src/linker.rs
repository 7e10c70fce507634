//! Relationship linker
//!
//! Consumes `processed.*` events and materializes the directed edges between
//! already-processed entities of one data source. The desired set is computed
//! from normalized data; the diff inserts new edges, refreshes surviving
//! ones, and soft-deletes absent ones only when the declaring entity was
//! re-synced under the event's sync id. Edge ownership is scoped to the data
//! source, so two integrations can never fight over the same edge.
//!
//! Declaring sides per edge type: identities declare their own group
//! memberships and license holds, groups declare nested group members, roles
//! declare their assignees, policies declare their targets.

use crate::connectors::SharedRegistry;
use crate::error::Result;
use crate::events::{linked_topic, LinkedEvent, ProcessedEvent};
use crate::fabric::{SharedTopicBus, TopicBus};
use crate::repository::{
    EntityIndex, EntityStore, RelationshipIndex, RelationshipStore, SharedRepository,
};
use crate::types::{
    now_ms, Entity, EntityRelationship, EntityType, RelationshipType,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Conditional-access target sentinels that are never materialized as edges.
const TARGET_SENTINELS: [&str; 3] = ["All", "None", "GuestsOrExternalUsers"];

#[derive(Debug, Default, Clone)]
pub struct LinkOutcome {
    pub created: usize,
    pub refreshed: usize,
    pub removed: usize,
}

pub struct Linker {
    repo: SharedRepository,
    bus: SharedTopicBus,
    registry: SharedRegistry,
}

impl Linker {
    pub fn new(repo: SharedRepository, bus: SharedTopicBus, registry: SharedRegistry) -> Self {
        Self { repo, bus, registry }
    }

    /// Reconcile edges for one processed event, then publish `linked.*` so
    /// the analyzer picks up the scope.
    pub async fn handle_processed(&self, event: &ProcessedEvent) -> Result<LinkOutcome> {
        let mut outcome = LinkOutcome::default();
        let authored = self
            .registry
            .get(&event.integration_slug)
            .map(|c| {
                c.link_rules
                    .authored
                    .get(&event.entity_type)
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        for relationship_type in authored {
            let partial = self.reconcile(event, relationship_type).await?;
            outcome.created += partial.created;
            outcome.refreshed += partial.refreshed;
            outcome.removed += partial.removed;
        }

        let linked = LinkedEvent {
            sync_id: event.sync_id.clone(),
            tenant_id: event.tenant_id.clone(),
            data_source_id: event.data_source_id.clone(),
            integration_slug: event.integration_slug.clone(),
            entity_type: event.entity_type,
            changed_entity_ids: event.changed_entity_ids.clone(),
        };
        self.bus
            .publish(
                &linked_topic(&event.integration_slug),
                serde_json::to_value(&linked)?,
            )
            .await?;
        Ok(outcome)
    }

    async fn reconcile(
        &self,
        event: &ProcessedEvent,
        relationship_type: RelationshipType,
    ) -> Result<LinkOutcome> {
        let now = now_ms();
        let mut outcome = LinkOutcome::default();

        let declaring = self
            .load_active(&event.data_source_id, event.entity_type)
            .await?;
        let declaring_ids: HashMap<&str, &Entity> =
            declaring.iter().map(|e| (e.id.as_str(), e)).collect();

        // (parent_id, child_id) -> declared desired edge.
        let desired = self
            .desired_edges(event, relationship_type, &declaring)
            .await?;

        let existing = self
            .repo
            .list_relationships(RelationshipIndex::ByDataSourceType {
                data_source_id: &event.data_source_id,
                relationship_type,
            })
            .await?;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut writes: Vec<EntityRelationship> = Vec::new();

        for mut edge in existing {
            let key = (edge.parent_entity_id.clone(), edge.child_entity_id.clone());
            // Only edges declared by this event's entity type are in scope.
            let declared_here = match (relationship_type, event.entity_type) {
                (RelationshipType::MemberOf, _) => {
                    declaring_ids.contains_key(edge.parent_entity_id.as_str())
                }
                (RelationshipType::HasLicense, EntityType::Identities) => {
                    declaring_ids.contains_key(edge.parent_entity_id.as_str())
                }
                (RelationshipType::AssignedRole, EntityType::Roles) => {
                    declaring_ids.contains_key(edge.child_entity_id.as_str())
                }
                (RelationshipType::AppliesTo, EntityType::Policies) => {
                    declaring_ids.contains_key(edge.parent_entity_id.as_str())
                }
                _ => false,
            };
            if !declared_here {
                continue;
            }

            if desired.contains(&key) {
                seen.insert(key);
                edge.sync_id = event.sync_id.clone();
                edge.last_seen_at = now;
                if edge.deleted_at.is_some() {
                    edge.deleted_at = None;
                    outcome.created += 1;
                } else {
                    outcome.refreshed += 1;
                }
                edge.updated_at = now;
                writes.push(edge);
                continue;
            }

            // Absent from desired. Tear down only when the declaring entity
            // was actually re-synced in this sync; a stale declarer keeps
            // its edges until its own sync observes the change.
            let declarer = match (relationship_type, event.entity_type) {
                (RelationshipType::AssignedRole, _) => declaring_ids.get(edge.child_entity_id.as_str()),
                _ => declaring_ids.get(edge.parent_entity_id.as_str()),
            };
            let resynced = matches!(declarer, Some(e) if e.sync_id == event.sync_id);
            if resynced && edge.deleted_at.is_none() {
                edge.deleted_at = Some(now);
                edge.updated_at = now;
                outcome.removed += 1;
                writes.push(edge);
            }
        }

        for (parent_id, child_id) in desired {
            if seen.contains(&(parent_id.clone(), child_id.clone())) {
                continue;
            }
            writes.push(EntityRelationship {
                id: Uuid::new_v4().to_string(),
                tenant_id: event.tenant_id.clone(),
                data_source_id: event.data_source_id.clone(),
                parent_entity_id: parent_id,
                child_entity_id: child_id,
                relationship_type,
                sync_id: event.sync_id.clone(),
                last_seen_at: now,
                updated_at: now,
                deleted_at: None,
            });
            outcome.created += 1;
        }

        if !writes.is_empty() {
            self.repo.upsert_relationships(&writes).await?;
        }
        debug!(
            sync_id = %event.sync_id,
            relationship_type = relationship_type.as_str(),
            created = outcome.created,
            refreshed = outcome.refreshed,
            removed = outcome.removed,
            "reconciled relationships"
        );
        Ok(outcome)
    }

    /// The full desired edge set declared by entities of the event's type.
    async fn desired_edges(
        &self,
        event: &ProcessedEvent,
        relationship_type: RelationshipType,
        declaring: &[Entity],
    ) -> Result<HashSet<(String, String)>> {
        let ds = &event.data_source_id;
        let mut desired = HashSet::new();
        match (event.entity_type, relationship_type) {
            (EntityType::Identities, RelationshipType::MemberOf) => {
                let groups = self.external_id_map(ds, EntityType::Groups).await?;
                for identity in declaring {
                    for group_ext in str_list(&identity.normalized_data, "group_external_ids") {
                        if let Some(group_id) = groups.get(&group_ext) {
                            desired.insert((identity.id.clone(), group_id.clone()));
                        }
                    }
                }
            }
            (EntityType::Identities, RelationshipType::HasLicense) => {
                let licenses = self.external_id_map(ds, EntityType::Licenses).await?;
                for identity in declaring {
                    for sku in str_list(&identity.normalized_data, "license_sku_ids") {
                        if let Some(license_id) = licenses.get(&sku) {
                            desired.insert((identity.id.clone(), license_id.clone()));
                        }
                    }
                }
            }
            (EntityType::Groups, RelationshipType::MemberOf) => {
                // Nested group membership only; identity memberships are
                // declared from the identity side.
                let groups: HashMap<String, String> = declaring
                    .iter()
                    .map(|g| (g.external_id.clone(), g.id.clone()))
                    .collect();
                for group in declaring {
                    for member_ext in str_list(&group.normalized_data, "member_external_ids") {
                        if let Some(member_group_id) = groups.get(&member_ext) {
                            desired.insert((member_group_id.clone(), group.id.clone()));
                        }
                    }
                }
            }
            (EntityType::Roles, RelationshipType::AssignedRole) => {
                let identities = self.external_id_map(ds, EntityType::Identities).await?;
                for role in declaring {
                    for member_ext in str_list(&role.normalized_data, "member_external_ids") {
                        if let Some(identity_id) = identities.get(&member_ext) {
                            desired.insert((identity_id.clone(), role.id.clone()));
                        }
                    }
                }
            }
            (EntityType::Policies, RelationshipType::AppliesTo) => {
                let identities = self.external_id_map(ds, EntityType::Identities).await?;
                let groups = self.external_id_map(ds, EntityType::Groups).await?;
                for policy in declaring {
                    for user_ext in str_list(&policy.normalized_data, "include_users") {
                        if TARGET_SENTINELS.contains(&user_ext.as_str()) {
                            continue;
                        }
                        if let Some(identity_id) = identities.get(&user_ext) {
                            desired.insert((policy.id.clone(), identity_id.clone()));
                        }
                    }
                    for group_ext in str_list(&policy.normalized_data, "include_groups") {
                        if let Some(group_id) = groups.get(&group_ext) {
                            desired.insert((policy.id.clone(), group_id.clone()));
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(desired)
    }

    async fn load_active(&self, data_source_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        Ok(self
            .repo
            .list_entities(EntityIndex::ByDataSourceType {
                data_source_id,
                entity_type,
            })
            .await?
            .into_iter()
            .filter(|e| e.deleted_at.is_none())
            .collect())
    }

    async fn external_id_map(
        &self,
        data_source_id: &str,
        entity_type: EntityType,
    ) -> Result<HashMap<String, String>> {
        Ok(self
            .load_active(data_source_id, entity_type)
            .await?
            .into_iter()
            .map(|e| (e.external_id, e.id))
            .collect())
    }
}

/// Read a string array field from normalized data, tolerating absence.
fn str_list(normalized: &serde_json::Value, key: &str) -> Vec<String> {
    normalized[key]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::replay::{ReplayConnector, ReplayFactory};
    use crate::connectors::{ConnectorRegistry, IntegrationCapability, LinkRules};
    use crate::fabric::memory::InProcessFabric;
    use crate::repository::memory::MemoryRepository;
    use crate::types::{AnalysisType, EntityState};
    use serde_json::json;
    use std::sync::Arc;

    fn entity(
        id: &str,
        external_id: &str,
        entity_type: EntityType,
        sync_id: &str,
        normalized: serde_json::Value,
    ) -> Entity {
        Entity {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            integration_id: "int-1".to_string(),
            data_source_id: "ds-1".to_string(),
            site_id: None,
            external_id: external_id.to_string(),
            entity_type,
            state: EntityState::Normal,
            data_hash: "h".to_string(),
            raw_data: json!({}),
            normalized_data: normalized,
            tags: Vec::new(),
            sync_id: sync_id.to_string(),
            last_seen_at: 1,
            updated_at: 1,
            deleted_at: None,
        }
    }

    fn processed(sync_id: &str, entity_type: EntityType) -> ProcessedEvent {
        ProcessedEvent {
            sync_id: sync_id.to_string(),
            tenant_id: "t-1".to_string(),
            data_source_id: "ds-1".to_string(),
            integration_slug: "microsoft-365".to_string(),
            entity_type,
            changed_entity_ids: Vec::new(),
            sweep_complete: true,
        }
    }

    fn linker() -> (Linker, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let bus = Arc::new(InProcessFabric::new());
        let mut registry = ConnectorRegistry::new();
        registry.register(IntegrationCapability {
            slug: "microsoft-365".to_string(),
            connector: Arc::new(ReplayFactory::new(Arc::new(ReplayConnector::new(
                "microsoft-365",
            )))),
            link_rules: LinkRules::directory(),
            analyses: AnalysisType::all(),
        });
        (
            Linker::new(repo.clone(), bus, Arc::new(registry)),
            repo,
        )
    }

    #[tokio::test]
    async fn identity_memberships_materialize_and_tear_down() {
        let (linker, repo) = linker();
        repo.upsert_entity(&entity(
            "g-1",
            "grp-1",
            EntityType::Groups,
            "s-0",
            json!({}),
        ))
        .await
        .unwrap();
        repo.upsert_entity(&entity(
            "i-1",
            "usr-1",
            EntityType::Identities,
            "s-1",
            json!({"group_external_ids": ["grp-1"]}),
        ))
        .await
        .unwrap();

        let outcome = linker
            .handle_processed(&processed("s-1", EntityType::Identities))
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);

        let edges = repo
            .list_relationships(RelationshipIndex::ByParentType {
                parent_entity_id: "i-1",
                relationship_type: RelationshipType::MemberOf,
            })
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].child_entity_id, "g-1");

        // Identity re-synced without the membership: edge torn down.
        repo.upsert_entity(&entity(
            "i-1",
            "usr-1",
            EntityType::Identities,
            "s-2",
            json!({"group_external_ids": []}),
        ))
        .await
        .unwrap();
        let outcome = linker
            .handle_processed(&processed("s-2", EntityType::Identities))
            .await
            .unwrap();
        assert_eq!(outcome.removed, 1);
        let edges = repo
            .list_relationships(RelationshipIndex::ByParentType {
                parent_entity_id: "i-1",
                relationship_type: RelationshipType::MemberOf,
            })
            .await
            .unwrap();
        assert!(edges[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn stale_declarers_keep_their_edges() {
        let (linker, repo) = linker();
        repo.upsert_entity(&entity(
            "g-1",
            "grp-1",
            EntityType::Groups,
            "s-0",
            json!({}),
        ))
        .await
        .unwrap();
        // i-1 was synced earlier (s-1) and still declares the membership;
        // i-2 is the one the new sync touched.
        repo.upsert_entity(&entity(
            "i-1",
            "usr-1",
            EntityType::Identities,
            "s-1",
            json!({"group_external_ids": ["grp-1"]}),
        ))
        .await
        .unwrap();
        linker
            .handle_processed(&processed("s-1", EntityType::Identities))
            .await
            .unwrap();

        repo.upsert_entity(&entity(
            "i-2",
            "usr-2",
            EntityType::Identities,
            "s-2",
            json!({"group_external_ids": []}),
        ))
        .await
        .unwrap();
        let outcome = linker
            .handle_processed(&processed("s-2", EntityType::Identities))
            .await
            .unwrap();
        // i-1 was not re-synced under s-2, so its edge survives even though
        // the desired set for s-2 still contains it (declared by i-1).
        assert_eq!(outcome.removed, 0);
        let edges = repo
            .list_relationships(RelationshipIndex::ByParentType {
                parent_entity_id: "i-1",
                relationship_type: RelationshipType::MemberOf,
            })
            .await
            .unwrap();
        assert!(edges[0].deleted_at.is_none());
    }

    #[tokio::test]
    async fn nested_groups_link_group_to_group() {
        let (linker, repo) = linker();
        repo.upsert_entity(&entity(
            "g-parent",
            "grp-parent",
            EntityType::Groups,
            "s-1",
            json!({"member_external_ids": ["grp-child", "usr-1"]}),
        ))
        .await
        .unwrap();
        repo.upsert_entity(&entity(
            "g-child",
            "grp-child",
            EntityType::Groups,
            "s-1",
            json!({"member_external_ids": []}),
        ))
        .await
        .unwrap();

        let outcome = linker
            .handle_processed(&processed("s-1", EntityType::Groups))
            .await
            .unwrap();
        // Only the group child materializes; usr-1 is declared identity-side.
        assert_eq!(outcome.created, 1);
        let edges = repo
            .list_relationships(RelationshipIndex::ByParentType {
                parent_entity_id: "g-child",
                relationship_type: RelationshipType::MemberOf,
            })
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].child_entity_id, "g-parent");
    }

    #[tokio::test]
    async fn policy_targets_skip_all_sentinel() {
        let (linker, repo) = linker();
        repo.upsert_entity(&entity(
            "i-1",
            "usr-1",
            EntityType::Identities,
            "s-0",
            json!({}),
        ))
        .await
        .unwrap();
        repo.upsert_entity(&entity(
            "p-1",
            "pol-1",
            EntityType::Policies,
            "s-1",
            json!({"include_users": ["All", "usr-1"], "include_groups": []}),
        ))
        .await
        .unwrap();

        let outcome = linker
            .handle_processed(&processed("s-1", EntityType::Policies))
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);
        let edges = repo
            .list_relationships(RelationshipIndex::ByParentType {
                parent_entity_id: "p-1",
                relationship_type: RelationshipType::AppliesTo,
            })
            .await
            .unwrap();
        assert_eq!(edges[0].child_entity_id, "i-1");
    }
}

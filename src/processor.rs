//! Entity processor
//!
//! Consumes `fetched.*` batches and reconciles them into the entity store:
//! insert on first sight, hash-compare on revisit, and mark-and-sweep soft
//! deletion when the final batch of a sync lands. Replaying a batch is a
//! no-op by hash and by `(external_id, sync_id)`.

use crate::error::Result;
use crate::events::{processed_topic, FetchedEvent, ProcessedEvent};
use crate::fabric::{SharedTopicBus, TopicBus};
use crate::repository::{EntityIndex, EntityStore, SharedRepository};
use crate::types::{now_ms, Entity, EntityState};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub swept: usize,
}

pub struct EntityProcessor {
    repo: SharedRepository,
    bus: SharedTopicBus,
}

impl EntityProcessor {
    pub fn new(repo: SharedRepository, bus: SharedTopicBus) -> Self {
        Self { repo, bus }
    }

    /// Process one fetched batch and publish the `processed.*` event.
    pub async fn handle_fetched(&self, event: &FetchedEvent) -> Result<BatchOutcome> {
        let now = now_ms();
        let mut outcome = BatchOutcome::default();
        let mut changed_entity_ids = Vec::new();
        let mut writes = Vec::with_capacity(event.records.len());

        for record in &event.records {
            let existing = self
                .repo
                .list_entities(EntityIndex::ByExternalId {
                    data_source_id: &event.data_source_id,
                    external_id: &record.external_id,
                })
                .await?
                .into_iter()
                .next();

            match existing {
                None => {
                    let entity = Entity {
                        id: Uuid::new_v4().to_string(),
                        tenant_id: event.tenant_id.clone(),
                        integration_id: event.integration_id.clone(),
                        data_source_id: event.data_source_id.clone(),
                        site_id: record.site_id.clone(),
                        external_id: record.external_id.clone(),
                        entity_type: event.entity_type,
                        state: EntityState::Normal,
                        data_hash: record.data_hash.clone(),
                        raw_data: record.raw_data.clone(),
                        normalized_data: record.normalized_data.clone(),
                        tags: Vec::new(),
                        sync_id: event.sync_id.clone(),
                        last_seen_at: now,
                        updated_at: now,
                        deleted_at: None,
                    };
                    changed_entity_ids.push(entity.id.clone());
                    writes.push(entity);
                    outcome.created += 1;
                }
                Some(mut entity) => {
                    let resurrected = entity.deleted_at.is_some();
                    if !resurrected && entity.data_hash == record.data_hash {
                        entity.last_seen_at = now;
                        entity.sync_id = event.sync_id.clone();
                        writes.push(entity);
                        outcome.unchanged += 1;
                        continue;
                    }
                    entity.data_hash = record.data_hash.clone();
                    entity.raw_data = record.raw_data.clone();
                    entity.normalized_data = record.normalized_data.clone();
                    entity.site_id = record.site_id.clone();
                    entity.sync_id = event.sync_id.clone();
                    entity.last_seen_at = now;
                    entity.updated_at = now;
                    entity.deleted_at = None;
                    changed_entity_ids.push(entity.id.clone());
                    writes.push(entity);
                    if resurrected {
                        outcome.created += 1;
                    } else {
                        outcome.updated += 1;
                    }
                }
            }
        }

        self.repo.upsert_entities(&writes).await?;

        if !event.has_more {
            let swept = self.sweep(event, now).await?;
            outcome.swept = swept.len();
            changed_entity_ids.extend(swept);
        }

        debug!(
            sync_id = %event.sync_id,
            entity_type = %event.entity_type.as_str(),
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            swept = outcome.swept,
            "processed batch"
        );

        let processed = ProcessedEvent {
            sync_id: event.sync_id.clone(),
            tenant_id: event.tenant_id.clone(),
            data_source_id: event.data_source_id.clone(),
            integration_slug: event.integration_slug.clone(),
            entity_type: event.entity_type,
            changed_entity_ids,
            sweep_complete: !event.has_more,
        };
        self.bus
            .publish(
                &processed_topic(event.entity_type),
                serde_json::to_value(&processed)?,
            )
            .await?;
        Ok(outcome)
    }

    /// Soft-delete every entity of this `(data source, type)` the finished
    /// sync did not observe.
    async fn sweep(&self, event: &FetchedEvent, now: i64) -> Result<Vec<String>> {
        let all = self
            .repo
            .list_entities(EntityIndex::ByDataSourceType {
                data_source_id: &event.data_source_id,
                entity_type: event.entity_type,
            })
            .await?;
        let mut swept = Vec::new();
        let mut writes = Vec::new();
        for mut entity in all {
            if entity.sync_id == event.sync_id || entity.deleted_at.is_some() {
                continue;
            }
            entity.deleted_at = Some(now);
            entity.updated_at = now;
            swept.push(entity.id.clone());
            writes.push(entity);
        }
        if !writes.is_empty() {
            self.repo.upsert_entities(&writes).await?;
            info!(
                sync_id = %event.sync_id,
                entity_type = %event.entity_type.as_str(),
                swept = writes.len(),
                "mark-and-sweep soft-deleted absent entities"
            );
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FetchedRecord;
    use crate::fabric::memory::InProcessFabric;
    use crate::hashing::data_hash;
    use crate::repository::memory::MemoryRepository;
    use crate::types::EntityType;
    use serde_json::json;
    use std::sync::Arc;

    fn record(external_id: &str, raw: serde_json::Value) -> FetchedRecord {
        FetchedRecord {
            external_id: external_id.to_string(),
            data_hash: data_hash(EntityType::Identities, &raw),
            raw_data: raw.clone(),
            normalized_data: json!({"enabled": true}),
            site_id: None,
        }
    }

    fn fetched(sync_id: &str, records: Vec<FetchedRecord>, has_more: bool) -> FetchedEvent {
        FetchedEvent {
            sync_id: sync_id.to_string(),
            tenant_id: "t-1".to_string(),
            data_source_id: "ds-1".to_string(),
            integration_id: "int-1".to_string(),
            integration_slug: "microsoft-365".to_string(),
            entity_type: EntityType::Identities,
            records,
            has_more,
            cursor: None,
        }
    }

    fn processor() -> (EntityProcessor, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let bus = Arc::new(InProcessFabric::new());
        (EntityProcessor::new(repo.clone(), bus), repo)
    }

    #[tokio::test]
    async fn create_then_unchanged_then_update() {
        let (processor, repo) = processor();
        let raw = json!({"id": "u-1", "displayName": "Alice"});

        let outcome = processor
            .handle_fetched(&fetched("s-1", vec![record("u-1", raw.clone())], false))
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);

        let outcome = processor
            .handle_fetched(&fetched("s-2", vec![record("u-1", raw)], false))
            .await
            .unwrap();
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.created + outcome.updated, 0);

        let changed = json!({"id": "u-1", "displayName": "Alice Renamed"});
        let outcome = processor
            .handle_fetched(&fetched("s-3", vec![record("u-1", changed)], false))
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);

        let rows = repo
            .list_entities(EntityIndex::ByDataSource {
                data_source_id: "ds-1",
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_id, "s-3");
    }

    #[tokio::test]
    async fn final_batch_sweeps_unseen_entities() {
        let (processor, repo) = processor();
        let a = json!({"id": "u-a"});
        let b = json!({"id": "u-b"});
        processor
            .handle_fetched(&fetched(
                "s-1",
                vec![record("u-a", a.clone()), record("u-b", b)],
                false,
            ))
            .await
            .unwrap();

        // Next sync only sees u-a; u-b must be soft-deleted.
        let outcome = processor
            .handle_fetched(&fetched("s-2", vec![record("u-a", a)], false))
            .await
            .unwrap();
        assert_eq!(outcome.swept, 1);

        let rows = repo
            .list_entities(EntityIndex::ByDataSource {
                data_source_id: "ds-1",
            })
            .await
            .unwrap();
        let deleted: Vec<_> = rows.iter().filter(|e| e.deleted_at.is_some()).collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].external_id, "u-b");
    }

    #[tokio::test]
    async fn intermediate_batches_do_not_sweep() {
        let (processor, _repo) = processor();
        let outcome = processor
            .handle_fetched(&fetched(
                "s-1",
                vec![record("u-a", json!({"id": "u-a"}))],
                true,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.swept, 0);
    }

    #[tokio::test]
    async fn replaying_a_batch_is_a_no_op() {
        let (processor, repo) = processor();
        let event = fetched("s-1", vec![record("u-a", json!({"id": "u-a"}))], false);
        processor.handle_fetched(&event).await.unwrap();
        let outcome = processor.handle_fetched(&event).await.unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.unchanged, 1);
        let rows = repo
            .list_entities(EntityIndex::ByDataSource {
                data_source_id: "ds-1",
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn reappearing_entities_are_resurrected() {
        let (processor, repo) = processor();
        let raw = json!({"id": "u-a"});
        processor
            .handle_fetched(&fetched("s-1", vec![record("u-a", raw.clone())], false))
            .await
            .unwrap();
        // Sync without the record sweeps it.
        processor
            .handle_fetched(&fetched("s-2", vec![], false))
            .await
            .unwrap();
        // It comes back: one active row again, not a duplicate.
        let outcome = processor
            .handle_fetched(&fetched("s-3", vec![record("u-a", raw)], false))
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);
        let rows = repo
            .list_entities(EntityIndex::ByExternalId {
                data_source_id: "ds-1",
                external_id: "u-a",
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].deleted_at.is_none());
    }
}

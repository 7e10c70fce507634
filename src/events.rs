//! Queue payloads and pipeline topic events
//!
//! Stage boundaries are JSON envelopes carrying `sync_id` so downstream
//! handlers can detect superseded or replayed inputs and stay idempotent.

use crate::types::{AnalysisType, EntityType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Work queue name for syncing one entity type of one integration.
pub fn sync_queue(integration_slug: &str, entity_type: EntityType) -> String {
    format!("sync:{}:{}", integration_slug, entity_type.as_str())
}

/// Work queue name for the entity processor.
pub fn process_queue() -> String {
    "process:entity".to_string()
}

/// Work queue name for an integration's linker.
pub fn link_queue(integration_slug: &str) -> String {
    format!("link:{}", integration_slug)
}

/// Work queue name for a tenant's analyzer runs.
pub fn analyze_queue(tenant_id: &str) -> String {
    format!("analyze:{}", tenant_id)
}

/// Topic for batches fetched from a connector.
pub fn fetched_topic(entity_type: EntityType) -> String {
    format!("fetched.{}", entity_type.as_str())
}

/// Topic for processed entity batches.
pub fn processed_topic(entity_type: EntityType) -> String {
    format!("processed.{}", entity_type.as_str())
}

/// Topic for relationship materialization results.
pub fn linked_topic(scope: &str) -> String {
    format!("linked.{}", scope)
}

pub const ANALYSIS_TOPIC: &str = "analysis.unified";

/// Queue payload for one sync job batch (spec contract, §external interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub sync_id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub integration_slug: String,
    pub integration_id: String,
    pub data_source_id: String,
    pub action: String,
    pub entity_type: EntityType,
    pub priority: i64,
    pub cursor: Option<String>,
    pub batch_number: u32,
    pub started_at: i64,
}

/// One raw record as fetched and fingerprinted by the adapter runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedRecord {
    pub external_id: String,
    pub data_hash: String,
    pub raw_data: serde_json::Value,
    pub normalized_data: serde_json::Value,
    pub site_id: Option<String>,
}

/// `fetched.<type>` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedEvent {
    pub sync_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_id: String,
    pub integration_slug: String,
    pub entity_type: EntityType,
    pub records: Vec<FetchedRecord>,
    pub has_more: bool,
    pub cursor: Option<String>,
}

/// `processed.<type>` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub sync_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_slug: String,
    pub entity_type: EntityType,
    pub changed_entity_ids: Vec<String>,
    /// Final batch of the sync; mark-and-sweep has run.
    pub sweep_complete: bool,
}

/// `linked.<scope>` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedEvent {
    pub sync_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_slug: String,
    pub entity_type: EntityType,
    pub changed_entity_ids: Vec<String>,
}

/// One analyzer-declared observation at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub analysis_type: AnalysisType,
    pub entity_id: String,
    pub severity: Severity,
    /// Stable textual identity used for alert deduplication.
    pub fingerprint: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Tag edits the alert manager applies to an entity before committing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagEdit {
    pub entity_id: String,
    pub tags_to_add: Vec<String>,
    pub tags_to_remove: Vec<String>,
}

/// Run statistics attached to each unified analysis event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRunStats {
    pub duration_ms: i64,
    pub query_count: usize,
    pub slow_query_count: usize,
    pub identities_analyzed: usize,
    pub findings_total: usize,
}

/// `analysis.unified` event payload. The analysis types that actually ran are
/// explicit so the alert manager can resolve stale alerts only for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedAnalysisEvent {
    pub sync_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_slug: String,
    pub analysis_types: Vec<AnalysisType>,
    /// Findings keyed by analysis type string.
    pub findings: BTreeMap<String, Vec<Finding>>,
    pub tag_edits: Vec<TagEdit>,
    pub entity_counts: BTreeMap<String, usize>,
    pub stats: AnalysisRunStats,
}

impl UnifiedAnalysisEvent {
    pub fn all_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.values().flatten()
    }
}

/// Queue payload that triggers one analyzer run for a data source scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub sync_id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub integration_slug: String,
}

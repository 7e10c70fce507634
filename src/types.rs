//! Core domain records for the posture pipeline
//!
//! Every persisted record carries `tenant_id`, `updated_at`, and an optional
//! `deleted_at` (soft delete, 90 day retention). Identifiers are opaque
//! strings. Time is milliseconds since epoch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Soft delete retention window before the janitor hard-purges a row.
pub const RETENTION_MS: i64 = 90 * 24 * 60 * 60 * 1000;

/// Milliseconds since epoch, the pipeline-wide clock representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

/// Isolation boundary. Every pipeline object hangs off exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub status: TenantStatus,
    /// Scheduler dispatch cap for this tenant.
    pub concurrent_job_limit: usize,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TenantStatus::Active,
            concurrent_job_limit: 5,
            updated_at: now_ms(),
            deleted_at: None,
        }
    }
}

/// Logical customer under a tenant, with optional PSA/RMM cross-linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub psa_company_id: Option<String>,
    pub rmm_site_id: Option<String>,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Companies,
    Endpoints,
    Identities,
    Firewalls,
    Groups,
    Roles,
    Policies,
    Licenses,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Companies => "companies",
            EntityType::Endpoints => "endpoints",
            EntityType::Identities => "identities",
            EntityType::Firewalls => "firewalls",
            EntityType::Groups => "groups",
            EntityType::Roles => "roles",
            EntityType::Policies => "policies",
            EntityType::Licenses => "licenses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "companies" => Some(EntityType::Companies),
            "endpoints" => Some(EntityType::Endpoints),
            "identities" => Some(EntityType::Identities),
            "firewalls" => Some(EntityType::Firewalls),
            "groups" => Some(EntityType::Groups),
            "roles" => Some(EntityType::Roles),
            "policies" => Some(EntityType::Policies),
            "licenses" => Some(EntityType::Licenses),
            _ => None,
        }
    }

    /// Queue action string for a sync of this entity type.
    pub fn sync_action(&self) -> String {
        format!("sync.{}", self.as_str())
    }
}

/// One entity type an integration can sync, with its scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedType {
    pub entity_type: EntityType,
    /// Global types are synced once per data source rather than per site.
    pub is_global: bool,
    pub priority: i64,
    pub rate_minutes: i64,
}

impl SupportedType {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            is_global: false,
            priority: 5,
            rate_minutes: 60,
        }
    }
}

/// Catalog entry describing one vendor integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub category: String,
    pub supported_types: Vec<SupportedType>,
    pub updated_at: i64,
}

impl Integration {
    pub fn supported_type(&self, entity_type: EntityType) -> Option<&SupportedType> {
        self.supported_types
            .iter()
            .find(|s| s.entity_type == entity_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceStatus {
    Active,
    Inactive,
    Error,
}

/// Maps an email domain suffix to the site that owns identities under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMapping {
    pub domain: String,
    pub site_id: String,
}

/// Opaque data source configuration. Vendor-specific keys are preserved
/// verbatim on round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceConfig {
    #[serde(default)]
    pub domain_mappings: Vec<DomainMapping>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Credentialed binding of one integration to one tenant (optionally one site).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub integration_id: String,
    pub integration_slug: String,
    pub config: DataSourceConfig,
    pub is_primary: bool,
    pub status: DataSourceStatus,
    pub credential_expiration_at: Option<i64>,
    pub last_sync_at: Option<i64>,
    pub current_sync_id: Option<String>,
    /// Last completed sync time per entity type, keyed by the type string.
    #[serde(default)]
    pub last_success_at: HashMap<String, i64>,
    /// Last error code surfaced to operators. Never silent.
    pub last_error: Option<String>,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl DataSource {
    pub fn credential_expired(&self, now: i64) -> bool {
        matches!(self.credential_expiration_at, Some(at) if at <= now)
    }
}

/// Entity display state derived from its active alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Low,
    Normal,
    Warn,
    High,
    Critical,
}

impl Default for EntityState {
    fn default() -> Self {
        EntityState::Normal
    }
}

/// Normalized record of one external object, keyed by
/// `(tenant_id, data_source_id, external_id)` while not soft-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub tenant_id: String,
    pub integration_id: String,
    pub data_source_id: String,
    pub site_id: Option<String>,
    pub external_id: String,
    pub entity_type: EntityType,
    pub state: EntityState,
    /// Content fingerprint over raw fields with churn-prone fields removed.
    pub data_hash: String,
    pub raw_data: serde_json::Value,
    pub normalized_data: serde_json::Value,
    /// UI tags maintained by the alert manager (Admin, No MFA, Stale, ...).
    #[serde(default)]
    pub tags: Vec<String>,
    pub sync_id: String,
    pub last_seen_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// identity -> group, or group -> group for nested memberships.
    MemberOf,
    /// identity -> role.
    AssignedRole,
    /// identity -> license.
    HasLicense,
    /// policy -> identity or policy -> group targeting.
    AppliesTo,
    /// Integration-specific parent link, e.g. endpoint -> company.
    ParentOf,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::MemberOf => "member_of",
            RelationshipType::AssignedRole => "assigned_role",
            RelationshipType::HasLicense => "has_license",
            RelationshipType::AppliesTo => "applies_to",
            RelationshipType::ParentOf => "parent_of",
        }
    }
}

/// Directed typed edge between two entities, scoped to one data source.
/// The owning data source is the only writer that may delete the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub parent_entity_id: String,
    pub child_entity_id: String,
    pub relationship_type: RelationshipType,
    pub sync_id: String,
    pub last_seen_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Entity display state for this severity when it is the max active one.
    pub fn entity_state(&self) -> EntityState {
        match self {
            Severity::Low => EntityState::Low,
            Severity::Medium => EntityState::Warn,
            Severity::High => EntityState::High,
            Severity::Critical => EntityState::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
    Suppressed,
}

/// Analysis families run by the unified analyzer. Alert rows record which
/// family produced them so resolution can be scoped to families that ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Mfa,
    PolicyGap,
    StaleUser,
    LicenseWaste,
    LicenseOveruse,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Mfa => "mfa",
            AnalysisType::PolicyGap => "policy_gap",
            AnalysisType::StaleUser => "stale_user",
            AnalysisType::LicenseWaste => "license_waste",
            AnalysisType::LicenseOveruse => "license_overuse",
        }
    }

    pub fn all() -> Vec<AnalysisType> {
        vec![
            AnalysisType::Mfa,
            AnalysisType::PolicyGap,
            AnalysisType::StaleUser,
            AnalysisType::LicenseWaste,
            AnalysisType::LicenseOveruse,
        ]
    }
}

/// Persisted lifecycle state of a finding, deduplicated by fingerprint.
/// At most one non-resolved row exists per `(entity_id, alert_type, fingerprint)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAlert {
    pub id: String,
    pub tenant_id: String,
    pub data_source_id: String,
    pub entity_id: String,
    pub alert_type: AnalysisType,
    pub severity: Severity,
    pub status: AlertStatus,
    /// Stable across analyzer reruns; the dedup key.
    pub fingerprint: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub resolved_at: Option<i64>,
    pub suppressed_at: Option<i64>,
    pub suppressed_until: Option<i64>,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Broken,
}

/// Work item emitted by the scheduler and driven by the adapter runtime.
/// At most one pending job exists per `(data_source_id, action)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub tenant_id: String,
    pub integration_id: String,
    pub integration_slug: String,
    pub data_source_id: String,
    /// e.g. `sync.identities`.
    pub action: String,
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub attempts_max: u32,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub error: Option<String>,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Unknown,
}

/// Tenant/site scoped endpoint agent identity tracked by the heartbeat manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub guid: String,
    pub hostname: String,
    pub version: String,
    pub ip_address: Option<String>,
    pub ext_address: Option<String>,
    pub mac_address: Option<String>,
    pub status: AgentStatus,
    pub status_changed_at: i64,
    pub last_heartbeat_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

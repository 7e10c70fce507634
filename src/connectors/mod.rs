//! Vendor connector capability surface
//!
//! A connector exposes the typed fetch methods one vendor supports and
//! returns classified outcomes; retry policy keys off the classification.
//! Integrations register a capability record in the [`ConnectorRegistry`] and
//! workers bind to it by slug lookup, so there is no dispatch hierarchy.

pub mod microsoft365;
pub mod replay;

use crate::error::{ErrorClass, PostureError};
use crate::types::{AnalysisType, DataSource, DataSourceConfig, EntityType, RelationshipType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Classified connector failure: `{transient, credential, permanent}`.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorErrorKind {
    Transient,
    Credential,
    Permanent,
}

impl ConnectorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectorErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectorErrorKind::Credential,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectorErrorKind::Permanent,
            message: message.into(),
        }
    }
}

impl From<ConnectorError> for PostureError {
    fn from(err: ConnectorError) -> Self {
        let class = match err.kind {
            ConnectorErrorKind::Transient => ErrorClass::Transient,
            ConnectorErrorKind::Credential => ErrorClass::Credential,
            ConnectorErrorKind::Permanent => ErrorClass::Permanent,
        };
        PostureError::connector(class, err.message)
    }
}

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// One raw object as the vendor returned it, with the connector's
/// normalization applied alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObject {
    pub external_id: String,
    pub raw_data: serde_json::Value,
    pub normalized_data: serde_json::Value,
}

/// One page of a paginated fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchPage {
    pub records: Vec<RawObject>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl FetchPage {
    pub fn of(records: Vec<RawObject>) -> Self {
        Self {
            records,
            cursor: None,
            has_more: false,
        }
    }
}

/// The per-vendor capability surface. Methods a vendor cannot serve return a
/// permanent error; the scheduler never emits jobs for unsupported types, so
/// hitting one is a configuration bug worth surfacing.
#[async_trait]
pub trait Connector: Send + Sync {
    fn slug(&self) -> &str;

    async fn check_health(&self) -> ConnectorResult<()>;

    async fn get_identities(&self, cursor: Option<&str>) -> ConnectorResult<FetchPage>;
    async fn get_groups(&self) -> ConnectorResult<FetchPage>;
    async fn get_roles(&self) -> ConnectorResult<FetchPage>;
    async fn get_conditional_access_policies(&self) -> ConnectorResult<FetchPage>;
    async fn get_security_defaults_enabled(&self) -> ConnectorResult<bool>;
    async fn get_subscribed_skus(&self) -> ConnectorResult<FetchPage>;
    async fn get_endpoints(&self, tenant_cfg: &DataSourceConfig) -> ConnectorResult<FetchPage>;
    async fn get_tenants(&self) -> ConnectorResult<FetchPage>;

    /// Typed fetch dispatch for the adapter runtime. The policies fetch folds
    /// the tenant Security Defaults state in as a synthetic policy record so
    /// downstream stages see one stream per entity type.
    async fn fetch(
        &self,
        entity_type: EntityType,
        cursor: Option<&str>,
        config: &DataSourceConfig,
    ) -> ConnectorResult<FetchPage> {
        match entity_type {
            EntityType::Identities => self.get_identities(cursor).await,
            EntityType::Groups => self.get_groups().await,
            EntityType::Roles => self.get_roles().await,
            EntityType::Policies => {
                let mut page = self.get_conditional_access_policies().await?;
                if cursor.is_none() {
                    let enabled = self.get_security_defaults_enabled().await?;
                    page.records.push(security_defaults_record(enabled));
                }
                Ok(page)
            }
            EntityType::Licenses => self.get_subscribed_skus().await,
            EntityType::Endpoints => self.get_endpoints(config).await,
            EntityType::Companies => self.get_tenants().await,
            EntityType::Firewalls => Err(ConnectorError::permanent(format!(
                "connector '{}' does not serve firewalls",
                self.slug()
            ))),
        }
    }
}

/// External id of the synthetic tenant Security Defaults policy entity.
pub const SECURITY_DEFAULTS_EXTERNAL_ID: &str = "security-defaults";

fn security_defaults_record(enabled: bool) -> RawObject {
    RawObject {
        external_id: SECURITY_DEFAULTS_EXTERNAL_ID.to_string(),
        raw_data: serde_json::json!({
            "id": SECURITY_DEFAULTS_EXTERNAL_ID,
            "isEnabled": enabled,
        }),
        normalized_data: serde_json::json!({
            "policy_kind": "security_defaults",
            "enabled": enabled,
        }),
    }
}

/// Builds a connector bound to one data source's credentials.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, data_source: &DataSource) -> crate::error::Result<Arc<dyn Connector>>;
}

/// Relationship types an integration's linker authors per processed entity
/// type. Edges outside this set are never touched by that linker.
#[derive(Debug, Clone, Default)]
pub struct LinkRules {
    pub authored: HashMap<EntityType, Vec<RelationshipType>>,
}

impl LinkRules {
    /// Rules for directory-style integrations: identities declare their
    /// group memberships and license holds, roles declare assignees,
    /// policies declare targets, groups declare nested members.
    pub fn directory() -> Self {
        let mut authored = HashMap::new();
        authored.insert(
            EntityType::Identities,
            vec![RelationshipType::MemberOf, RelationshipType::HasLicense],
        );
        authored.insert(EntityType::Groups, vec![RelationshipType::MemberOf]);
        authored.insert(EntityType::Roles, vec![RelationshipType::AssignedRole]);
        authored.insert(EntityType::Policies, vec![RelationshipType::AppliesTo]);
        Self { authored }
    }
}

/// Capability record per integration: how to fetch, how to link, which
/// analyses to run. Workers bind to `(integration, entity type)` through
/// table lookup instead of a class hierarchy.
pub struct IntegrationCapability {
    pub slug: String,
    pub connector: Arc<dyn ConnectorFactory>,
    pub link_rules: LinkRules,
    pub analyses: Vec<AnalysisType>,
}

/// Process-wide table of integration capabilities.
#[derive(Default)]
pub struct ConnectorRegistry {
    capabilities: HashMap<String, IntegrationCapability>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    pub fn register(&mut self, capability: IntegrationCapability) {
        self.capabilities
            .insert(capability.slug.clone(), capability);
    }

    pub fn get(&self, slug: &str) -> Option<&IntegrationCapability> {
        self.capabilities.get(slug)
    }

    pub fn connector_for(&self, data_source: &DataSource) -> crate::error::Result<Arc<dyn Connector>> {
        let capability = self.get(&data_source.integration_slug).ok_or_else(|| {
            PostureError::Configuration(format!(
                "no capability registered for integration '{}'",
                data_source.integration_slug
            ))
        })?;
        capability.connector.create(data_source)
    }

    pub fn slugs(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }
}

pub type SharedRegistry = Arc<ConnectorRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_errors_convert_with_their_class() {
        let err: PostureError = ConnectorError::credential("401 from vendor").into();
        assert_eq!(err.class(), ErrorClass::Credential);
        let err: PostureError = ConnectorError::transient("upstream 503").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn directory_link_rules_cover_the_authored_edge_types() {
        let rules = LinkRules::directory();
        assert!(rules.authored[&EntityType::Identities].contains(&RelationshipType::MemberOf));
        assert!(rules.authored[&EntityType::Policies].contains(&RelationshipType::AppliesTo));
        assert!(!rules.authored.contains_key(&EntityType::Licenses));
    }
}

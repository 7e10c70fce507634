//! Replay connector
//!
//! Fixture-backed implementation of the capability surface for development
//! and testing, the same role the in-memory stores play for the repository.
//! Tests mutate the fixture set between syncs and can inject classified
//! failures to exercise retry and credential paths.

use super::{
    Connector, ConnectorError, ConnectorFactory, ConnectorResult, FetchPage, RawObject,
};
use crate::types::{DataSource, DataSourceConfig, EntityType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub struct ReplayConnector {
    slug: String,
    records: Mutex<HashMap<EntityType, Vec<RawObject>>>,
    security_defaults_enabled: AtomicBool,
    /// Page size for identity fetches; zero serves everything in one page.
    page_size: usize,
    /// Fail this many upcoming calls with the stored error before recovering.
    fail_next: AtomicU32,
    injected_error: Mutex<Option<ConnectorError>>,
}

impl ReplayConnector {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            records: Mutex::new(HashMap::new()),
            security_defaults_enabled: AtomicBool::new(false),
            page_size: 0,
            fail_next: AtomicU32::new(0),
            injected_error: Mutex::new(None),
        }
    }

    pub fn with_page_size(slug: impl Into<String>, page_size: usize) -> Self {
        let mut connector = Self::new(slug);
        connector.page_size = page_size;
        connector
    }

    pub fn set_records(&self, entity_type: EntityType, records: Vec<RawObject>) {
        self.records.lock().insert(entity_type, records);
    }

    pub fn set_security_defaults(&self, enabled: bool) {
        self.security_defaults_enabled
            .store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: u32, error: ConnectorError) {
        self.fail_next.store(count, Ordering::SeqCst);
        *self.injected_error.lock() = Some(error);
    }

    fn check_injected(&self) -> ConnectorResult<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            let error = self
                .injected_error
                .lock()
                .clone()
                .unwrap_or_else(|| ConnectorError::transient("injected failure"));
            return Err(error);
        }
        Ok(())
    }

    fn all(&self, entity_type: EntityType) -> Vec<RawObject> {
        self.records
            .lock()
            .get(&entity_type)
            .cloned()
            .unwrap_or_default()
    }

    fn page(&self, entity_type: EntityType, cursor: Option<&str>) -> ConnectorResult<FetchPage> {
        self.check_injected()?;
        let records = self.all(entity_type);
        if self.page_size == 0 {
            return Ok(FetchPage::of(records));
        }
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| ConnectorError::permanent(format!("bad cursor '{}'", c)))?,
            None => 0,
        };
        let offset = offset.min(records.len());
        let end = (offset + self.page_size).min(records.len());
        let has_more = end < records.len();
        Ok(FetchPage {
            records: records[offset..end].to_vec(),
            cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }
}

#[async_trait]
impl Connector for ReplayConnector {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn check_health(&self) -> ConnectorResult<()> {
        self.check_injected()
    }

    async fn get_identities(&self, cursor: Option<&str>) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Identities, cursor)
    }

    async fn get_groups(&self) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Groups, None)
    }

    async fn get_roles(&self) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Roles, None)
    }

    async fn get_conditional_access_policies(&self) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Policies, None)
    }

    async fn get_security_defaults_enabled(&self) -> ConnectorResult<bool> {
        self.check_injected()?;
        Ok(self.security_defaults_enabled.load(Ordering::SeqCst))
    }

    async fn get_subscribed_skus(&self) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Licenses, None)
    }

    async fn get_endpoints(&self, _tenant_cfg: &DataSourceConfig) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Endpoints, None)
    }

    async fn get_tenants(&self) -> ConnectorResult<FetchPage> {
        self.page(EntityType::Companies, None)
    }
}

/// Hands out one shared replay connector for every data source.
pub struct ReplayFactory {
    pub connector: Arc<ReplayConnector>,
}

impl ReplayFactory {
    pub fn new(connector: Arc<ReplayConnector>) -> Self {
        Self { connector }
    }
}

impl ConnectorFactory for ReplayFactory {
    fn create(&self, _data_source: &DataSource) -> crate::error::Result<Arc<dyn Connector>> {
        Ok(self.connector.clone())
    }
}

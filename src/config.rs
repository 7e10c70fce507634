//! Pipeline configuration
//!
//! Built from the process environment at startup. Every knob has a default
//! matching the operational contract; tests override individual fields.

use crate::error::{PostureError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Environment variable names recognized at startup.
pub const ENV_STORE_URL: &str = "STORE_URL";
pub const ENV_STORE_API_KEY: &str = "STORE_API_KEY";
pub const ENV_QUEUE_URL: &str = "QUEUE_URL";
pub const ENV_CACHE_URL: &str = "CACHE_URL";
pub const ENV_FEATURE_FLAGS: &str = "FEATURE_FLAGS_JSON";

/// Per-stage timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub adapter_ms: u64,
    pub processor_ms: u64,
    pub linker_ms: u64,
    pub analyzer_ms: u64,
    pub alerts_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            adapter_ms: 10 * 60 * 1000,
            processor_ms: 2 * 60 * 1000,
            linker_ms: 2 * 60 * 1000,
            analyzer_ms: 5 * 60 * 1000,
            alerts_ms: 2 * 60 * 1000,
        }
    }
}

/// Heartbeat manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Scan interval for the stale checker.
    pub stale_scan_interval_ms: u64,
    /// An online agent this long past its last heartbeat goes offline.
    pub stale_after_ms: i64,
    /// Periodic flush interval for coalesced writes.
    pub flush_interval_ms: u64,
    /// Flush immediately once this many agents are pending.
    pub flush_batch_size: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stale_scan_interval_ms: 30_000,
            stale_after_ms: 180_000,
            flush_interval_ms: 5 * 60 * 1000,
            flush_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub store_url: String,
    pub store_api_key: Option<String>,
    pub queue_url: Option<String>,
    pub cache_url: Option<String>,
    /// Feature flags parsed from FEATURE_FLAGS_JSON; unknown flags kept as-is.
    pub feature_flags: HashMap<String, bool>,

    /// Scheduler loop interval.
    pub scheduler_tick_ms: u64,
    /// Adapter worker concurrency across tenants.
    pub adapter_concurrency: usize,
    /// Default retry budget for sync jobs.
    pub attempts_max: u32,
    /// Base backoff for failed jobs; doubled per attempt, capped below.
    pub backoff_base_ms: i64,
    pub backoff_cap_ms: i64,
    /// Coalescing window for analyzer runs per (tenant, data source).
    pub analyzer_debounce_ms: i64,
    /// Queue drain budget during graceful shutdown.
    pub drain_timeout_ms: u64,

    pub timeouts: StageTimeouts,
    pub heartbeat: HeartbeatConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_url: "memory://local".to_string(),
            store_api_key: None,
            queue_url: None,
            cache_url: None,
            feature_flags: HashMap::new(),
            scheduler_tick_ms: 60_000,
            adapter_concurrency: 50,
            attempts_max: 5,
            backoff_base_ms: 30_000,
            backoff_cap_ms: 15 * 60 * 1000,
            analyzer_debounce_ms: 5 * 60 * 1000,
            drain_timeout_ms: 30_000,
            timeouts: StageTimeouts::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build configuration from the process environment.
    ///
    /// # Errors
    /// - `PostureError::Configuration` when a URL is present but unparseable
    ///   or the feature flag JSON is malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = PipelineConfig::default();

        if let Ok(store_url) = std::env::var(ENV_STORE_URL) {
            validate_url(ENV_STORE_URL, &store_url)?;
            config.store_url = store_url;
        }
        config.store_api_key = std::env::var(ENV_STORE_API_KEY).ok();
        if let Ok(queue_url) = std::env::var(ENV_QUEUE_URL) {
            validate_url(ENV_QUEUE_URL, &queue_url)?;
            config.queue_url = Some(queue_url);
        }
        if let Ok(cache_url) = std::env::var(ENV_CACHE_URL) {
            validate_url(ENV_CACHE_URL, &cache_url)?;
            config.cache_url = Some(cache_url);
        }
        if let Ok(flags_json) = std::env::var(ENV_FEATURE_FLAGS) {
            config.feature_flags = serde_json::from_str(&flags_json).map_err(|e| {
                PostureError::Configuration(format!("{} is not valid JSON: {}", ENV_FEATURE_FLAGS, e))
            })?;
        }

        Ok(config)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.feature_flags.get(name).copied().unwrap_or(false)
    }
}

fn validate_url(name: &str, value: &str) -> Result<()> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| PostureError::Configuration(format!("{} '{}' is not a URL: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_operational_contract() {
        let config = PipelineConfig::default();
        assert_eq!(config.adapter_concurrency, 50);
        assert_eq!(config.attempts_max, 5);
        assert_eq!(config.timeouts.adapter_ms, 600_000);
        assert_eq!(config.heartbeat.stale_after_ms, 180_000);
        assert_eq!(config.heartbeat.flush_batch_size, 50);
        assert_eq!(config.analyzer_debounce_ms, 300_000);
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(validate_url("STORE_URL", "not a url").is_err());
        assert!(validate_url("STORE_URL", "redis://localhost:6379").is_ok());
    }
}

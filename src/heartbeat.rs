//! Agent heartbeat manager
//!
//! Tracks endpoint agent liveness without a durable write per pulse. The hot
//! state lives in an in-process map mirrored to the side cache; durable
//! writes are coalesced through a pending set and flushed in bounded batches,
//! either on a timer or as soon as the set reaches the batch size. Set
//! membership dedupes, so at most one payload per agent is ever in flight,
//! and a single flight lock keeps batches from overlapping.

use crate::cache::{agent_key, update_key, SharedCache, SideCache, PENDING_AGENTS_KEY};
use crate::config::HeartbeatConfig;
use crate::error::{PostureError, Result};
use crate::repository::{AgentStore, SharedRepository};
use crate::types::{now_ms, Agent, AgentStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Metadata carried by one heartbeat pulse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMeta {
    pub tenant_id: String,
    pub site_id: Option<String>,
    pub guid: String,
    pub hostname: String,
    pub version: String,
    pub ip_address: Option<String>,
    pub ext_address: Option<String>,
    pub mac_address: Option<String>,
}

/// Cached liveness snapshot for one agent, mirrored to `agent:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAgent {
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
    pub last_heartbeat: i64,
}

impl CachedAgent {
    fn from_row(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            tenant_id: agent.tenant_id.clone(),
            site_id: agent.site_id.clone(),
            guid: agent.guid.clone(),
            hostname: agent.hostname.clone(),
            version: agent.version.clone(),
            ip_address: agent.ip_address.clone(),
            ext_address: agent.ext_address.clone(),
            mac_address: agent.mac_address.clone(),
            status: agent.status,
            status_changed_at: agent.status_changed_at,
            last_heartbeat: agent.last_heartbeat_at,
        }
    }

    fn to_row(&self, now: i64) -> Agent {
        Agent {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            site_id: self.site_id.clone(),
            guid: self.guid.clone(),
            hostname: self.hostname.clone(),
            version: self.version.clone(),
            ip_address: self.ip_address.clone(),
            ext_address: self.ext_address.clone(),
            mac_address: self.mac_address.clone(),
            status: self.status,
            status_changed_at: self.status_changed_at,
            last_heartbeat_at: self.last_heartbeat,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn metadata_differs(&self, meta: &HeartbeatMeta) -> bool {
        self.guid != meta.guid
            || self.hostname != meta.hostname
            || self.version != meta.version
            || self.ip_address != meta.ip_address
            || self.ext_address != meta.ext_address
            || self.mac_address != meta.mac_address
    }
}

pub struct HeartbeatManager {
    repo: SharedRepository,
    cache: SharedCache,
    config: HeartbeatConfig,
    agents: DashMap<String, CachedAgent>,
    /// At most one durable batch in flight per process.
    flight: Mutex<()>,
    stopped: AtomicBool,
}

impl HeartbeatManager {
    pub fn new(repo: SharedRepository, cache: SharedCache, config: HeartbeatConfig) -> Self {
        Self {
            repo,
            cache,
            config,
            agents: DashMap::new(),
            flight: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Load every known agent from the durable store into the cache.
    pub async fn seed(&self) -> Result<usize> {
        let rows = self.repo.list_all_agents().await?;
        let seeded = rows.len();
        for row in rows {
            let cached = CachedAgent::from_row(&row);
            self.cache
                .set(&agent_key(&cached.id), &serde_json::to_string(&cached)?)
                .await?;
            self.agents.insert(cached.id.clone(), cached);
        }
        info!(agents = seeded, "heartbeat cache seeded");
        Ok(seeded)
    }

    pub async fn record_heartbeat(&self, agent_id: &str, meta: &HeartbeatMeta) -> Result<()> {
        self.record_heartbeat_at(agent_id, meta, now_ms()).await
    }

    pub async fn record_heartbeat_at(
        &self,
        agent_id: &str,
        meta: &HeartbeatMeta,
        now: i64,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PostureError::Shutdown);
        }

        let previous = self.agents.get(agent_id).map(|a| a.clone());
        let status_transitioned = previous
            .as_ref()
            .map(|a| a.status != AgentStatus::Online)
            .unwrap_or(true);
        let metadata_changed = previous
            .as_ref()
            .map(|a| a.metadata_differs(meta))
            .unwrap_or(true);

        let cached = CachedAgent {
            id: agent_id.to_string(),
            tenant_id: meta.tenant_id.clone(),
            site_id: meta.site_id.clone(),
            guid: meta.guid.clone(),
            hostname: meta.hostname.clone(),
            version: meta.version.clone(),
            ip_address: meta.ip_address.clone(),
            ext_address: meta.ext_address.clone(),
            mac_address: meta.mac_address.clone(),
            status: AgentStatus::Online,
            status_changed_at: if status_transitioned {
                now
            } else {
                previous.as_ref().map(|a| a.status_changed_at).unwrap_or(now)
            },
            last_heartbeat: now,
        };
        self.cache
            .set(&agent_key(agent_id), &serde_json::to_string(&cached)?)
            .await?;
        self.agents.insert(agent_id.to_string(), cached.clone());

        if status_transitioned || metadata_changed {
            self.enqueue_update(&cached, now).await?;
        }
        Ok(())
    }

    /// Mark every online agent past the liveness threshold offline.
    pub async fn check_stale(&self) -> Result<usize> {
        self.check_stale_at(now_ms()).await
    }

    pub async fn check_stale_at(&self, now: i64) -> Result<usize> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let stale_ids: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| {
                entry.status == AgentStatus::Online
                    && now - entry.last_heartbeat > self.config.stale_after_ms
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut marked = 0;
        for agent_id in stale_ids {
            let Some(mut cached) = self.agents.get(&agent_id).map(|a| a.clone()) else {
                continue;
            };
            if cached.status != AgentStatus::Online
                || now - cached.last_heartbeat <= self.config.stale_after_ms
            {
                continue;
            }
            cached.status = AgentStatus::Offline;
            cached.status_changed_at = now;
            self.cache
                .set(&agent_key(&agent_id), &serde_json::to_string(&cached)?)
                .await?;
            self.agents.insert(agent_id.clone(), cached.clone());
            self.enqueue_update(&cached, now).await?;
            marked += 1;
            debug!(agent_id = %agent_id, "agent went offline");
        }
        Ok(marked)
    }

    /// Pop up to one batch of pending agents and write them durably.
    /// Failures are logged per agent and requeued for the next cycle.
    pub async fn flush_once(&self) -> Result<usize> {
        let _flight = self.flight.lock().await;
        let ids = self
            .cache
            .set_pop(PENDING_AGENTS_KEY, self.config.flush_batch_size)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(ids.len());
        for agent_id in &ids {
            match self.cache.get(&update_key(agent_id)).await? {
                Some(payload) => match serde_json::from_str::<Agent>(&payload) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "dropping unreadable heartbeat payload");
                        self.cache.delete(&update_key(agent_id)).await?;
                    }
                },
                None => {
                    // Payload vanished; rebuild from the hot map if we can.
                    if let Some(cached) = self.agents.get(agent_id.as_str()) {
                        rows.push(cached.to_row(now_ms()));
                    }
                }
            }
        }

        let failed = self.repo.batch_update_agents(&rows).await?;
        let mut written = 0;
        for row in &rows {
            if failed.contains(&row.id) {
                warn!(agent_id = %row.id, "durable agent update failed, will retry next cycle");
                self.cache.set_add(PENDING_AGENTS_KEY, &row.id).await?;
                continue;
            }
            self.cache.delete(&update_key(&row.id)).await?;
            written += 1;
        }
        debug!(written, failed = failed.len(), "heartbeat batch flushed");
        Ok(written)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.cache.set_len(PENDING_AGENTS_KEY).await
    }

    /// Flush everything still pending, then close the cache client. No
    /// durable writes happen after this returns.
    pub async fn stop(&self) -> Result<()> {
        loop {
            if self.flush_once().await? == 0 {
                break;
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.cache.close().await?;
        info!("heartbeat manager stopped");
        Ok(())
    }

    async fn enqueue_update(&self, cached: &CachedAgent, now: i64) -> Result<()> {
        self.cache
            .set(
                &update_key(&cached.id),
                &serde_json::to_string(&cached.to_row(now))?,
            )
            .await?;
        self.cache.set_add(PENDING_AGENTS_KEY, &cached.id).await?;

        if self.pending_count().await? >= self.config.flush_batch_size {
            self.flush_once().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::repository::memory::MemoryRepository;
    use crate::repository::AgentStore;
    use std::sync::Arc;

    fn manager() -> (HeartbeatManager, Arc<MemoryRepository>, Arc<MemoryCache>) {
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(MemoryCache::new());
        let manager = HeartbeatManager::new(repo.clone(), cache.clone(), HeartbeatConfig::default());
        (manager, repo, cache)
    }

    fn meta(guid: &str) -> HeartbeatMeta {
        HeartbeatMeta {
            tenant_id: "t-1".to_string(),
            site_id: None,
            guid: guid.to_string(),
            hostname: "host-1".to_string(),
            version: "1.2.3".to_string(),
            ip_address: Some("10.0.0.5".to_string()),
            ext_address: None,
            mac_address: None,
        }
    }

    #[tokio::test]
    async fn repeat_heartbeats_do_not_requeue_unchanged_agents() {
        let (manager, _repo, _cache) = manager();
        let now = 1_000_000;
        manager
            .record_heartbeat_at("a-1", &meta("g-1"), now)
            .await
            .unwrap();
        assert_eq!(manager.pending_count().await.unwrap(), 1);
        manager.flush_once().await.unwrap();
        assert_eq!(manager.pending_count().await.unwrap(), 0);

        // Same metadata, still online: nothing new to write.
        for i in 1..10 {
            manager
                .record_heartbeat_at("a-1", &meta("g-1"), now + i * 60_000)
                .await
                .unwrap();
        }
        assert_eq!(manager.pending_count().await.unwrap(), 0);

        // Metadata change queues exactly one update.
        manager
            .record_heartbeat_at("a-1", &meta("g-2"), now + 700_000)
            .await
            .unwrap();
        assert_eq!(manager.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn silent_agents_go_offline_and_flush_once() {
        let (manager, repo, _cache) = manager();
        let start = 1_000_000;
        // Heartbeat every 60 s for 10 minutes.
        for i in 0..10 {
            manager
                .record_heartbeat_at("a-1", &meta("g-1"), start + i * 60_000)
                .await
                .unwrap();
        }
        manager.flush_once().await.unwrap();
        let row = repo.get_agent("a-1").await.unwrap().unwrap();
        assert_eq!(row.status, AgentStatus::Online);

        // 3 minutes past the last pulse the stale checker flips it offline.
        let last = start + 9 * 60_000;
        assert_eq!(manager.check_stale_at(last + 170_000).await.unwrap(), 0);
        assert_eq!(manager.check_stale_at(last + 181_000).await.unwrap(), 1);
        // Re-running the check does not double-enqueue.
        assert_eq!(manager.check_stale_at(last + 200_000).await.unwrap(), 0);
        assert_eq!(manager.pending_count().await.unwrap(), 1);

        let written = manager.flush_once().await.unwrap();
        assert_eq!(written, 1);
        let row = repo.get_agent("a-1").await.unwrap().unwrap();
        assert_eq!(row.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn pending_set_reaching_batch_size_flushes_immediately() {
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(MemoryCache::new());
        let config = HeartbeatConfig {
            flush_batch_size: 3,
            ..HeartbeatConfig::default()
        };
        let manager = HeartbeatManager::new(repo.clone(), cache, config);

        for i in 0..3 {
            manager
                .record_heartbeat_at(&format!("a-{}", i), &meta("g"), 1_000_000)
                .await
                .unwrap();
        }
        // The third enqueue crossed the threshold and flushed inline.
        assert_eq!(manager.pending_count().await.unwrap(), 0);
        assert!(repo.get_agent("a-0").await.unwrap().is_some());
        assert!(repo.get_agent("a-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn seed_loads_the_durable_store() {
        let (manager, repo, _cache) = manager();
        repo.upsert_agent(&Agent {
            id: "a-1".to_string(),
            tenant_id: "t-1".to_string(),
            site_id: None,
            guid: "g-1".to_string(),
            hostname: "host-1".to_string(),
            version: "1.0.0".to_string(),
            ip_address: None,
            ext_address: None,
            mac_address: None,
            status: AgentStatus::Offline,
            status_changed_at: 1,
            last_heartbeat_at: 1,
            updated_at: 1,
            deleted_at: None,
        })
        .await
        .unwrap();

        assert_eq!(manager.seed().await.unwrap(), 1);
        // A fresh heartbeat is a status transition and queues a write.
        manager
            .record_heartbeat_at("a-1", &meta("g-1"), 2_000)
            .await
            .unwrap();
        assert_eq!(manager.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_flushes_and_blocks_further_writes() {
        let (manager, repo, _cache) = manager();
        manager
            .record_heartbeat_at("a-1", &meta("g-1"), 1_000)
            .await
            .unwrap();
        manager.stop().await.unwrap();
        assert!(repo.get_agent("a-1").await.unwrap().is_some());
        assert!(manager
            .record_heartbeat_at("a-1", &meta("g-1"), 2_000)
            .await
            .is_err());
    }
}

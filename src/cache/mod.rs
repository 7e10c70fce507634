//! Fast key-value side cache
//!
//! Backs the heartbeat manager so agent liveness does not hit the durable
//! store on every pulse. String values plus one set with atomic pop, which
//! is all the coalescing protocol needs.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Cache key for one agent's liveness snapshot.
pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// Set of agent ids with a durable write pending.
pub const PENDING_AGENTS_KEY: &str = "heartbeat:pending_agents";

/// Cache key for one agent's pending durable payload.
pub fn update_key(agent_id: &str) -> String {
    format!("heartbeat:update:{}", agent_id)
}

#[async_trait]
pub trait SideCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add a member to a set. Membership dedupes, so at most one payload per
    /// agent is ever in flight.
    async fn set_add(&self, set_key: &str, member: &str) -> Result<()>;

    /// Atomically remove and return up to `count` members.
    async fn set_pop(&self, set_key: &str, count: usize) -> Result<Vec<String>>;

    async fn set_len(&self, set_key: &str) -> Result<usize>;

    /// Release the underlying client. No operations may follow.
    async fn close(&self) -> Result<()>;
}

pub type SharedCache = Arc<dyn SideCache>;

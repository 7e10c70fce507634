//! Redis side cache adapter
//!
//! Wraps a connection manager so reconnects are transparent to callers. Keys
//! are namespaced by the caller through the builders in the parent module.

use super::SideCache;
use crate::error::{PostureError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RedisCache {
    manager: ConnectionManager,
    closed: AtomicBool,
}

impl RedisCache {
    /// Connect and verify the server responds before handing the cache out.
    pub async fn connect(cache_url: &str) -> Result<Self> {
        let client = redis::Client::open(cache_url)
            .map_err(|e| PostureError::Cache(format!("invalid CACHE_URL: {}", e)))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| PostureError::Cache(format!("failed to connect to Redis: {}", e)))?;
        let cache = Self {
            manager,
            closed: AtomicBool::new(false),
        };
        cache.ping().await?;
        Ok(cache)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| PostureError::Cache(format!("Redis ping failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostureError::Cache("cache client is closed".to_string()));
        }
        Ok(self.manager.clone())
    }
}

#[async_trait]
impl SideCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn set_add(&self, set_key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn()?;
        conn.sadd::<_, _, ()>(set_key, member).await?;
        Ok(())
    }

    async fn set_pop(&self, set_key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let popped: Vec<String> = redis::cmd("SPOP")
            .arg(set_key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn set_len(&self, set_key: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        Ok(conn.scard(set_key).await?)
    }

    async fn close(&self) -> Result<()> {
        // The manager drops its connections when the last clone goes away;
        // flipping the flag stops new operations immediately.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

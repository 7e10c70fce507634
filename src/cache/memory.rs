//! In-memory side cache
//!
//! Default backend for development and testing, mirroring the semantics of
//! the Redis backend including atomic set pop and post-close rejection.

use super::SideCache;
use crate::error::{PostureError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct MemoryCache {
    values: DashMap<String, String>,
    sets: Mutex<std::collections::HashMap<String, BTreeSet<String>>>,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            sets: Mutex::new(std::collections::HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostureError::Cache("cache client is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SideCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.values.remove(key);
        Ok(())
    }

    async fn set_add(&self, set_key: &str, member: &str) -> Result<()> {
        self.ensure_open()?;
        self.sets
            .lock()
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_pop(&self, set_key: &str, count: usize) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(set_key) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::with_capacity(count.min(set.len()));
        while popped.len() < count {
            match set.pop_first() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn set_len(&self, set_key: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self
            .sets
            .lock()
            .get(set_key)
            .map(|s| s.len())
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_pop_is_exhaustive_and_dedupes() {
        let cache = MemoryCache::new();
        cache.set_add("s", "a").await.unwrap();
        cache.set_add("s", "b").await.unwrap();
        cache.set_add("s", "a").await.unwrap();
        assert_eq!(cache.set_len("s").await.unwrap(), 2);
        let popped = cache.set_pop("s", 10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(cache.set_len("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let cache = MemoryCache::new();
        cache.set("k", "v").await.unwrap();
        cache.close().await.unwrap();
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", "v2").await.is_err());
    }
}

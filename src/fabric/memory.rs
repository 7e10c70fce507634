//! In-process fabric implementation
//!
//! Work queues are per-name message lists with priority and delayed
//! availability; topics are fan-out channels. Everything lives behind short
//! critical sections so producers and consumers never hold a lock across an
//! await point.

use super::*;
use crate::error::PostureError;
use crate::types::now_ms;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

struct QueuedMessage {
    message: QueueMessage,
    seq: u64,
}

#[derive(Default)]
struct QueueInner {
    ready: Vec<QueuedMessage>,
    inflight: HashMap<String, QueueMessage>,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }
}

/// In-process work queue and topic bus.
pub struct InProcessFabric {
    queues: DashMap<String, Arc<QueueState>>,
    subscribers: RwLock<Vec<(String, mpsc::UnboundedSender<TopicEvent>)>>,
    seq: AtomicU64,
}

impl InProcessFabric {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    /// Pop the best available message, or report when the next delayed one
    /// becomes available.
    fn try_pop(state: &QueueState, now: i64) -> (Option<QueueMessage>, Option<i64>) {
        let mut inner = state.inner.lock();
        let mut best: Option<usize> = None;
        let mut next_available: Option<i64> = None;
        for (i, queued) in inner.ready.iter().enumerate() {
            if queued.message.available_at > now {
                next_available = Some(
                    next_available
                        .map(|at: i64| at.min(queued.message.available_at))
                        .unwrap_or(queued.message.available_at),
                );
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let a = &inner.ready[i];
                    let b = &inner.ready[j];
                    if (a.message.priority, std::cmp::Reverse(a.seq))
                        > (b.message.priority, std::cmp::Reverse(b.seq))
                    {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        match best {
            Some(i) => {
                let queued = inner.ready.swap_remove(i);
                inner
                    .inflight
                    .insert(queued.message.id.clone(), queued.message.clone());
                (Some(queued.message), next_available)
            }
            None => (None, next_available),
        }
    }
}

impl Default for InProcessFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InProcessFabric {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        let now = now_ms();
        let message = QueueMessage {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            payload,
            priority: options.priority,
            attempts: 0,
            data_source_id: options.data_source_id,
            action: options.action,
            enqueued_at: now,
            available_at: now + options.delay_ms.max(0),
        };
        let id = message.id.clone();
        let state = self.queue(queue);
        {
            let mut inner = state.inner.lock();
            inner.ready.push(QueuedMessage {
                message,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            });
        }
        state.notify.notify_waiters();
        Ok(id)
    }

    async fn dequeue(&self, queue: &str, wait_ms: u64) -> Result<Option<QueueMessage>> {
        let state = self.queue(queue);
        let deadline = now_ms() + wait_ms as i64;
        loop {
            let now = now_ms();
            let (message, next_available) = Self::try_pop(&state, now);
            if message.is_some() {
                return Ok(message);
            }
            let remaining = deadline - now;
            if remaining <= 0 {
                return Ok(None);
            }
            // Wake early if a delayed message comes due before the deadline.
            let sleep_ms = match next_available {
                Some(at) => remaining.min((at - now).max(1)),
                None => remaining,
            };
            let _ = tokio::time::timeout(
                Duration::from_millis(sleep_ms as u64),
                state.notify.notified(),
            )
            .await;
        }
    }

    async fn ack(&self, queue: &str, message_id: &str) -> Result<()> {
        let state = self.queue(queue);
        let mut inner = state.inner.lock();
        inner.inflight.remove(message_id).ok_or_else(|| {
            PostureError::Queue(format!(
                "ack for unknown message '{}' on queue '{}'",
                message_id, queue
            ))
        })?;
        Ok(())
    }

    async fn nack(&self, queue: &str, message_id: &str, delay_ms: i64) -> Result<()> {
        let state = self.queue(queue);
        {
            let mut inner = state.inner.lock();
            let mut message = inner.inflight.remove(message_id).ok_or_else(|| {
                PostureError::Queue(format!(
                    "nack for unknown message '{}' on queue '{}'",
                    message_id, queue
                ))
            })?;
            message.attempts += 1;
            message.available_at = now_ms() + delay_ms.max(0);
            inner.ready.push(QueuedMessage {
                message,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            });
        }
        state.notify.notify_waiters();
        Ok(())
    }

    async fn has_pending_for(
        &self,
        queue: &str,
        data_source_id: &str,
        action: &str,
    ) -> Result<bool> {
        let state = self.queue(queue);
        let inner = state.inner.lock();
        let matches = |m: &QueueMessage| {
            m.data_source_id.as_deref() == Some(data_source_id)
                && m.action.as_deref() == Some(action)
        };
        Ok(inner.ready.iter().any(|q| matches(&q.message))
            || inner.inflight.values().any(matches))
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let state = self.queue(queue);
        let inner = state.inner.lock();
        Ok(inner.ready.len() + inner.inflight.len())
    }

    async fn is_drained(&self) -> Result<bool> {
        for entry in self.queues.iter() {
            let inner = entry.value().inner.lock();
            if !inner.ready.is_empty() || !inner.inflight.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl TopicBus for InProcessFabric {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|(pattern, sender)| {
            if !topic_matches(pattern, topic) {
                return !sender.is_closed();
            }
            sender
                .send(TopicEvent {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<TopicSubscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .push((pattern.to_string(), sender));
        Ok(TopicSubscription {
            pattern: pattern.to_string(),
            receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let fabric = InProcessFabric::new();
        fabric
            .enqueue("q", json!({"n": 1}), EnqueueOptions { priority: 1, ..Default::default() })
            .await
            .unwrap();
        fabric
            .enqueue("q", json!({"n": 2}), EnqueueOptions { priority: 9, ..Default::default() })
            .await
            .unwrap();
        let first = fabric.dequeue("q", 10).await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 2);
        let second = fabric.dequeue("q", 10).await.unwrap().unwrap();
        assert_eq!(second.payload["n"], 1);
    }

    #[tokio::test]
    async fn delayed_messages_are_withheld_until_due() {
        let fabric = InProcessFabric::new();
        fabric
            .enqueue(
                "q",
                json!({}),
                EnqueueOptions { delay_ms: 60_000, ..Default::default() },
            )
            .await
            .unwrap();
        assert!(fabric.dequeue("q", 20).await.unwrap().is_none());
        assert_eq!(fabric.depth("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nacked_messages_are_redelivered_with_attempts() {
        let fabric = InProcessFabric::new();
        fabric
            .enqueue("q", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let message = fabric.dequeue("q", 10).await.unwrap().unwrap();
        fabric.nack("q", &message.id, 0).await.unwrap();
        let redelivered = fabric.dequeue("q", 50).await.unwrap().unwrap();
        assert_eq!(redelivered.id, message.id);
        assert_eq!(redelivered.attempts, 1);
        fabric.ack("q", &redelivered.id).await.unwrap();
        assert!(fabric.is_drained().await.unwrap());
    }

    #[tokio::test]
    async fn pending_dedup_sees_queued_and_inflight() {
        let fabric = InProcessFabric::new();
        fabric
            .enqueue(
                "sync:microsoft-365:identities",
                json!({}),
                EnqueueOptions {
                    data_source_id: Some("ds-1".to_string()),
                    action: Some("sync.identities".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(fabric
            .has_pending_for("sync:microsoft-365:identities", "ds-1", "sync.identities")
            .await
            .unwrap());
        let message = fabric
            .dequeue("sync:microsoft-365:identities", 10)
            .await
            .unwrap()
            .unwrap();
        // Still pending while in flight.
        assert!(fabric
            .has_pending_for("sync:microsoft-365:identities", "ds-1", "sync.identities")
            .await
            .unwrap());
        fabric
            .ack("sync:microsoft-365:identities", &message.id)
            .await
            .unwrap();
        assert!(!fabric
            .has_pending_for("sync:microsoft-365:identities", "ds-1", "sync.identities")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn topics_fan_out_to_matching_subscribers() {
        let fabric = InProcessFabric::new();
        let mut fetched = fabric.subscribe("fetched.*").await.unwrap();
        let mut exact = fabric.subscribe("analysis.unified").await.unwrap();
        fabric
            .publish("fetched.identities", json!({"sync_id": "s-1"}))
            .await
            .unwrap();
        fabric
            .publish("analysis.unified", json!({"sync_id": "s-2"}))
            .await
            .unwrap();
        let event = fetched.next().await.unwrap();
        assert_eq!(event.topic, "fetched.identities");
        let event = exact.next().await.unwrap();
        assert_eq!(event.payload["sync_id"], "s-2");
    }
}

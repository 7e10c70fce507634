//! Message and queue fabric
//!
//! Two abstractions carry the pipeline: named work queues with priority,
//! delay, and dedup queries, and topic pub/sub for stage progress events.
//! Delivery is at-least-once on both; handlers are idempotent by `sync_id`.
//!
//! The broker itself is an external collaborator. The in-process fabric in
//! [`memory`] implements this contract for single-process deployments.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options for one enqueue. Messages tagged with a data source and action are
/// visible to `has_pending_for` for scheduler dedup.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub delay_ms: i64,
    pub data_source_id: Option<String>,
    pub action: Option<String>,
}

/// One in-flight or queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub attempts: u32,
    pub data_source_id: Option<String>,
    pub action: Option<String>,
    pub enqueued_at: i64,
    pub available_at: i64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String>;

    /// Take the highest-priority available message, waiting up to `wait_ms`
    /// for one to become available. The message stays in-flight until acked
    /// or nacked; an unacked message is redelivered, which is where the
    /// at-least-once guarantee comes from.
    async fn dequeue(&self, queue: &str, wait_ms: u64) -> Result<Option<QueueMessage>>;

    async fn ack(&self, queue: &str, message_id: &str) -> Result<()>;

    /// Return a message to the queue for redelivery after `delay_ms`.
    async fn nack(&self, queue: &str, message_id: &str, delay_ms: i64) -> Result<()>;

    /// Dedup query: is any queued or in-flight message on this queue tagged
    /// with the given data source and action?
    async fn has_pending_for(&self, queue: &str, data_source_id: &str, action: &str)
        -> Result<bool>;

    async fn depth(&self, queue: &str) -> Result<usize>;

    /// True when every queue is empty with nothing in flight.
    async fn is_drained(&self) -> Result<bool>;
}

/// One event delivered to a topic subscriber.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Receiver half of a topic subscription.
pub struct TopicSubscription {
    pub pattern: String,
    pub receiver: mpsc::UnboundedReceiver<TopicEvent>,
}

impl TopicSubscription {
    pub async fn next(&mut self) -> Option<TopicEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait TopicBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;

    /// Subscribe to a topic pattern. `fetched.*` matches every topic under
    /// the `fetched.` prefix; anything else is an exact match.
    async fn subscribe(&self, pattern: &str) -> Result<TopicSubscription>;
}

/// Does a topic match a subscription pattern?
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == topic,
    }
}

pub type SharedWorkQueue = Arc<dyn WorkQueue>;
pub type SharedTopicBus = Arc<dyn TopicBus>;

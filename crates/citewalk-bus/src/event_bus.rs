//! The publish/subscribe contract shared by every bus backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BusError;

/// Outcome of a handler invocation. Errors are logged by the consumer and
/// the record is committed anyway.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Hints attached to a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Carried as a header; the log does not reorder on it.
    pub priority: Option<i32>,
    /// The record is not visible to consumers before `now + delay`.
    pub delay: Option<Duration>,
    /// Record key. Also selects the partition, so equal keys stay ordered.
    pub dedup_key: Option<String>,
}

impl PublishOptions {
    /// Options with only a dedup key set.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            dedup_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Owned partitions processed simultaneously. Records within one
    /// partition are always handled one at a time.
    pub concurrency: usize,
    /// Consumer group. Defaults to the topic name.
    pub group: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            group: None,
        }
    }
}

impl SubscribeOptions {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A record delivered to a handler.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub event: String,
    pub data: serde_json::Value,
    /// Publish time, Unix epoch milliseconds.
    pub timestamp: i64,
    pub priority: Option<i32>,
}

/// Receives records for a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: BusMessage) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: BusMessage) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Generic publish/subscribe over a partitioned topic log.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append `data` to `topic`. Creates the topic if needed.
    async fn publish(
        &self,
        topic: &str,
        event: &str,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError>;

    /// Start a long-lived consumer for `topic`. Returns once the consumer
    /// is running.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError>;

    /// Stop every consumer, wait for in-flight handlers, release resources.
    /// Failures are logged, never returned.
    async fn shutdown(&self);
}

/// Convenience methods for typed payloads.
#[async_trait]
pub trait EventBusExt: EventBus {
    async fn publish_json<T>(
        &self,
        topic: &str,
        event: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<(), BusError>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(data)?;
        self.publish(topic, event, value, options).await
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}

//! Durable event bus backed by a SQLite log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use citewalk_core::config::BusConfig;
use citewalk_core::db::unix_timestamp_millis;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consumer::Consumer;
use crate::error::BusError;
use crate::event_bus::{EventBus, EventHandler, PublishOptions, SubscribeOptions};
use crate::partition::Partitioner;
use crate::record;
use crate::storage::{AppendParams, BusDatabase};
use crate::topics::TopicRegistry;

/// Tuning for [`SqliteEventBus`].
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Partitions given to topics this process creates.
    pub partitions: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub batch_size: u32,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for BusOptions {
    fn from(c: &BusConfig) -> Self {
        Self {
            partitions: c.partitions.max(1),
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            session_timeout: Duration::from_millis(c.session_timeout_ms),
            batch_size: c.batch_size.max(1),
        }
    }
}

/// Event bus over a SQLite partitioned log.
///
/// Cheap to clone; clones share consumers and shutdown.
#[derive(Clone)]
pub struct SqliteEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    db: BusDatabase,
    options: BusOptions,
    topics: TopicRegistry,
    partitioner: Partitioner,
    wakeups: Mutex<HashMap<String, Arc<Notify>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl SqliteEventBus {
    pub fn new(db: BusDatabase, options: BusOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                db,
                topics: TopicRegistry::new(options.partitions),
                options,
                partitioner: Partitioner::default(),
                wakeups: Mutex::new(HashMap::new()),
                consumers: Mutex::new(Vec::new()),
                shutdown_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn database(&self) -> &BusDatabase {
        &self.inner.db
    }

    /// Create a topic explicitly. Fails with
    /// [`BusError::TopicAlreadyExists`] if it is already there.
    pub async fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        validate_topic(topic)?;
        self.inner.topics.create_topic(&self.inner.db, topic).await
    }

    async fn wakeup_for(&self, topic: &str) -> Arc<Notify> {
        let mut wakeups = self.inner.wakeups.lock().await;
        Arc::clone(
            wakeups
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.trim().is_empty() {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

#[async_trait]
impl EventBus for SqliteEventBus {
    async fn publish(
        &self,
        topic: &str,
        event: &str,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_topic(topic)?;

        let partitions = self.inner.topics.ensure_topic(&self.inner.db, topic).await;
        let key = options.dedup_key.as_deref();
        let partition = self.inner.partitioner.select(key, partitions);

        let now = unix_timestamp_millis();
        let available_at = options.delay.map_or(now, |d| {
            now.saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        });
        let encoded = record::encode(event, data, now, key, options.priority)?;

        let offset = self
            .inner
            .db
            .append_record(&AppendParams {
                topic,
                partition: i64::from(partition),
                key: encoded.key.as_deref(),
                headers: &encoded.headers,
                value: &encoded.value,
                available_at,
                now,
            })
            .await?;

        debug!(topic, event, partition, offset, "Published record");
        self.wakeup_for(topic).await.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_topic(topic)?;

        let partitions = self.inner.topics.ensure_topic(&self.inner.db, topic).await;
        let group = options.group.unwrap_or_else(|| topic.to_string());

        let consumer = Consumer {
            db: self.inner.db.clone(),
            topic: topic.to_string(),
            group,
            member_id: uuid::Uuid::new_v4().to_string(),
            partitions,
            concurrency: options.concurrency.max(1),
            handler,
            options: self.inner.options.clone(),
            wake: self.wakeup_for(topic).await,
            shutdown: self.inner.shutdown_tx.subscribe(),
        };

        let handle = tokio::spawn(consumer.run());
        self.inner.consumers.lock().await.push(handle);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.inner.consumers.lock().await);
        let total = handles.len();
        let mut failures = 0usize;
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                failures += 1;
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }

        self.inner.db.close().await;
        info!(consumers = total, failures, "Event bus shut down");
    }
}

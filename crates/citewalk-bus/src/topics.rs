//! Lazy, idempotent topic creation.

use std::collections::HashMap;

use citewalk_core::db::{DatabaseError, unix_timestamp_millis};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::storage::BusDatabase;

/// Tracks topics confirmed to exist during this process run.
///
/// Only successful checks are remembered, so a failed creation is retried on
/// the next publish or subscribe.
#[derive(Debug)]
pub struct TopicRegistry {
    default_partitions: u32,
    confirmed: Mutex<HashMap<String, u32>>,
}

impl TopicRegistry {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            confirmed: Mutex::new(HashMap::new()),
        }
    }

    /// Create `topic` with the default partition count.
    pub async fn create_topic(&self, db: &BusDatabase, topic: &str) -> Result<(), BusError> {
        match db
            .insert_topic(topic, self.default_partitions, unix_timestamp_millis())
            .await
        {
            Ok(()) => Ok(()),
            Err(DatabaseError::UniqueViolation(_)) => {
                Err(BusError::TopicAlreadyExists(topic.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure `topic` exists and return its partition count.
    ///
    /// "Already exists" is success. Any other failure is logged and the
    /// default partition count is returned so the caller can carry on.
    pub async fn ensure_topic(&self, db: &BusDatabase, topic: &str) -> u32 {
        if let Some(n) = self.confirmed.lock().await.get(topic) {
            return *n;
        }

        match self.create_topic(db, topic).await {
            Ok(()) => debug!(topic, partitions = self.default_partitions, "Topic created"),
            Err(BusError::TopicAlreadyExists(_)) => {}
            Err(e) => {
                warn!(topic, error = %e, "Failed to ensure topic exists");
                return self.default_partitions;
            }
        }

        match db.topic_partitions(topic).await {
            Ok(Some(n)) => {
                self.confirmed.lock().await.insert(topic.to_string(), n);
                n
            }
            Ok(None) => {
                warn!(topic, "Topic missing right after creation");
                self.default_partitions
            }
            Err(e) => {
                warn!(topic, error = %e, "Failed to read topic metadata");
                self.default_partitions
            }
        }
    }

    #[cfg(test)]
    pub async fn is_confirmed(&self, topic: &str) -> bool {
        self.confirmed.lock().await.contains_key(topic)
    }
}

//! Notification outbox.
//!
//! A notification is first written as a PENDING row and only then announced
//! on the bus. If the announcement is lost, the row is still there and the
//! requeue sweep publishes it again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use citewalk_bus::{EventBus, EventBusExt, PublishOptions};
use citewalk_core::db::unix_timestamp_millis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PushError;
use crate::storage::{NewOutboxRow, OutboxItem, Priority, PushDatabase};

/// Topic carrying delivery jobs.
pub const PUSH_TOPIC: &str = "push-processing";

/// Event name of a delivery job.
pub const PUSH_JOB_EVENT: &str = "push.deliver";

/// Rows examined per requeue sweep.
const REQUEUE_BATCH: u32 = 500;

/// Bus payload of a delivery job: a reference to an outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushJob {
    pub id: String,
}

/// A notification to be delivered to every active device of a user.
#[derive(Debug, Clone, Default)]
pub struct NewNotification {
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub payload: BTreeMap<String, String>,
    pub priority: Priority,
}

const fn bus_priority(priority: Priority) -> i32 {
    match priority {
        Priority::High => 10,
        Priority::Normal => 5,
    }
}

#[derive(Clone)]
pub struct PushOutbox {
    db: PushDatabase,
    bus: Arc<dyn EventBus>,
}

impl PushOutbox {
    pub fn new(db: PushDatabase, bus: Arc<dyn EventBus>) -> Self {
        Self { db, bus }
    }

    /// Record a notification and schedule its delivery.
    ///
    /// Only the insert can fail the call. A failed publish is logged and
    /// left to [`requeue_stale_pending`](Self::requeue_stale_pending).
    pub async fn enqueue(&self, notification: &NewNotification) -> Result<OutboxItem, PushError> {
        if notification.recipient_id.trim().is_empty() {
            return Err(PushError::Validation("recipient_id is required".to_string()));
        }
        if notification.kind.trim().is_empty() {
            return Err(PushError::Validation("kind is required".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let item = self
            .db
            .insert_outbox_item(&NewOutboxRow {
                id: &id,
                recipient_id: &notification.recipient_id,
                kind: &notification.kind,
                title: &notification.title,
                body: &notification.body,
                payload: &notification.payload,
                priority: notification.priority,
                now: unix_timestamp_millis(),
            })
            .await?;

        if let Err(e) = self.publish_job(&item.id, item.priority).await {
            warn!(id = %item.id, error = %e, "Failed to publish push job; requeue sweep will retry");
        } else {
            debug!(id = %item.id, kind = %item.kind, "Notification enqueued");
        }

        Ok(item)
    }

    /// Re-publish jobs for PENDING rows created more than `max_age` ago.
    ///
    /// Returns the number of jobs published. Duplicates are harmless since
    /// the worker skips rows that are no longer pending.
    pub async fn requeue_stale_pending(&self, max_age: Duration) -> Result<usize, PushError> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_timestamp_millis().saturating_sub(max_age_ms);
        let ids = self.db.stale_pending_ids(cutoff, REQUEUE_BATCH).await?;

        let mut published = 0;
        for id in &ids {
            let priority = self
                .db
                .get_outbox_item(id)
                .await?
                .map_or(Priority::Normal, |item| item.priority);
            match self.publish_job(id, priority).await {
                Ok(()) => published += 1,
                Err(e) => warn!(id = %id, error = %e, "Failed to requeue push job"),
            }
        }

        if published > 0 {
            info!(count = published, "Requeued stale pending notifications");
        }
        Ok(published)
    }

    async fn publish_job(&self, id: &str, priority: Priority) -> Result<(), PushError> {
        let options = PublishOptions {
            priority: Some(bus_priority(priority)),
            ..PublishOptions::keyed(id)
        };
        self.bus
            .publish_json(PUSH_TOPIC, PUSH_JOB_EVENT, &PushJob { id: id.to_string() }, options)
            .await?;
        Ok(())
    }
}

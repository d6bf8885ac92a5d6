//! Outbox queries.
//!
//! Every state transition is guarded by `status = 'pending'`, so a
//! redelivered job can never move an item out of a terminal state.

use std::collections::BTreeMap;

use citewalk_core::db::DatabaseError;
use sqlx::types::Json;

use super::db::PushDatabase;
use super::models::{OutboxItem, OutboxStatus, Priority};

/// Column values for a new outbox item.
#[derive(Debug)]
pub struct NewOutboxRow<'a> {
    pub id: &'a str,
    pub recipient_id: &'a str,
    pub kind: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub payload: &'a BTreeMap<String, String>,
    pub priority: Priority,
    pub now: i64,
}

impl PushDatabase {
    // =========================================================================
    // Outbox queries
    // =========================================================================

    pub async fn insert_outbox_item(
        &self,
        row: &NewOutboxRow<'_>,
    ) -> Result<OutboxItem, DatabaseError> {
        let item = sqlx::query_as::<_, OutboxItem>(
            "INSERT INTO push_outbox \
             (id, recipient_id, kind, title, body, payload, priority, status, attempt_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?) \
             RETURNING *",
        )
        .bind(row.id)
        .bind(row.recipient_id)
        .bind(row.kind)
        .bind(row.title)
        .bind(row.body)
        .bind(Json(row.payload))
        .bind(row.priority)
        .bind(OutboxStatus::Pending)
        .bind(row.now)
        .fetch_one(self.pool())
        .await?;

        Ok(item)
    }

    pub async fn get_outbox_item(&self, id: &str) -> Result<Option<OutboxItem>, DatabaseError> {
        let item = sqlx::query_as::<_, OutboxItem>("SELECT * FROM push_outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(item)
    }

    /// PENDING -> SUPPRESSED. Returns `false` if the item was not pending.
    pub async fn mark_outbox_suppressed(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE push_outbox SET status = ?, last_error = ? WHERE id = ? AND status = ?",
        )
        .bind(OutboxStatus::Suppressed)
        .bind(reason)
        .bind(id)
        .bind(OutboxStatus::Pending)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PENDING -> SENT, counting the attempt.
    pub async fn mark_outbox_sent(&self, id: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE push_outbox SET status = ?, sent_at = ?, attempt_count = attempt_count + 1 \
             WHERE id = ? AND status = ?",
        )
        .bind(OutboxStatus::Sent)
        .bind(now)
        .bind(id)
        .bind(OutboxStatus::Pending)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PENDING -> FAILED, counting the attempt.
    pub async fn mark_outbox_failed(&self, id: &str, error: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE push_outbox SET status = ?, last_error = ?, attempt_count = attempt_count + 1 \
             WHERE id = ? AND status = ?",
        )
        .bind(OutboxStatus::Failed)
        .bind(error)
        .bind(id)
        .bind(OutboxStatus::Pending)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Ids of items still PENDING that were created before `created_before`,
    /// oldest first.
    pub async fn stale_pending_ids(
        &self,
        created_before: i64,
        limit: u32,
    ) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM push_outbox WHERE status = ? AND created_at < ? \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(OutboxStatus::Pending)
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn db_with_item(id: &str, now: i64) -> PushDatabase {
        let db = PushDatabase::open_in_memory().await.unwrap();
        insert(&db, id, now).await;
        db
    }

    async fn insert(db: &PushDatabase, id: &str, now: i64) {
        let mut payload = BTreeMap::new();
        payload.insert("postId".to_string(), "p-9".to_string());
        db.insert_outbox_item(&NewOutboxRow {
            id,
            recipient_id: "u1",
            kind: "reply",
            title: "New reply",
            body: "Someone replied",
            payload: &payload,
            priority: Priority::High,
            now,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn inserted_item_is_pending() {
        let db = db_with_item("n1", 100).await;
        let item = db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.payload.0.get("postId").map(String::as_str), Some("p-9"));
        assert!(item.sent_at.is_none());
        assert!(db.get_outbox_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sent_is_terminal() {
        let db = db_with_item("n1", 100).await;
        assert!(db.mark_outbox_sent("n1", 200).await.unwrap());
        assert!(!db.mark_outbox_sent("n1", 300).await.unwrap());
        assert!(!db.mark_outbox_failed("n1", "late").await.unwrap());
        assert!(!db.mark_outbox_suppressed("n1", "late").await.unwrap());

        let item = db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Sent);
        assert_eq!(item.sent_at, Some(200));
        assert_eq!(item.attempt_count, 1);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn suppressed_records_reason_without_attempt() {
        let db = db_with_item("n1", 100).await;
        assert!(db.mark_outbox_suppressed("n1", "no active tokens").await.unwrap());
        let item = db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Suppressed);
        assert_eq!(item.last_error.as_deref(), Some("no active tokens"));
        assert_eq!(item.attempt_count, 0);
    }

    #[tokio::test]
    async fn failed_counts_attempt() {
        let db = db_with_item("n1", 100).await;
        assert!(db.mark_outbox_failed("n1", "db unavailable").await.unwrap());
        let item = db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(item.attempt_count, 1);
    }

    #[tokio::test]
    async fn stale_pending_returns_oldest_pending_only() {
        let db = db_with_item("old", 100).await;
        insert(&db, "older", 50).await;
        insert(&db, "new", 1_000).await;
        insert(&db, "done", 10).await;
        db.mark_outbox_sent("done", 20).await.unwrap();

        let ids = db.stale_pending_ids(500, 10).await.unwrap();
        assert_eq!(ids, vec!["older".to_string(), "old".to_string()]);
        assert_eq!(db.stale_pending_ids(500, 1).await.unwrap().len(), 1);
    }
}

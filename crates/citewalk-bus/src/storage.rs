//! SQLite storage for the event bus log, offsets, and group membership.

use citewalk_core::db::DatabaseError;

citewalk_core::define_database!(BusDatabase, "Bus database migrations complete");

/// A stored record as read back by consumers.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRecord {
    pub record_offset: i64,
    pub record_key: Option<String>,
    pub headers: String,
    pub value: String,
    pub available_at: i64,
}

/// Column values for one append.
#[derive(Debug)]
pub struct AppendParams<'a> {
    pub topic: &'a str,
    pub partition: i64,
    pub key: Option<&'a str>,
    pub headers: &'a str,
    pub value: &'a str,
    pub available_at: i64,
    pub now: i64,
}

impl BusDatabase {
    // =========================================================================
    // Topic queries
    // =========================================================================

    /// Insert a topic row. Fails with `UniqueViolation` if it exists.
    pub async fn insert_topic(
        &self,
        name: &str,
        partitions: u32,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO bus_topics (name, partitions, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(i64::from(partitions))
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Partition count of a topic, if it exists.
    pub async fn topic_partitions(&self, name: &str) -> Result<Option<u32>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT partitions FROM bus_topics WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        row.map(|(n,)| {
            u32::try_from(n)
                .map_err(|_| DatabaseError::Query(format!("invalid partition count {n}")))
        })
        .transpose()
    }

    // =========================================================================
    // Record queries
    // =========================================================================

    /// Append a record at the next dense offset of its partition.
    ///
    /// The offset is computed and inserted in one statement, so concurrent
    /// appenders (even across processes) never collide.
    pub async fn append_record(&self, p: &AppendParams<'_>) -> Result<i64, DatabaseError> {
        let (offset,): (i64,) = sqlx::query_as(
            "INSERT INTO bus_records \
             (topic, partition_id, record_offset, record_key, headers, value, available_at, created_at) \
             SELECT ?, ?, COALESCE(MAX(record_offset), -1) + 1, ?, ?, ?, ?, ? \
             FROM bus_records WHERE topic = ? AND partition_id = ? \
             RETURNING record_offset",
        )
        .bind(p.topic)
        .bind(p.partition)
        .bind(p.key)
        .bind(p.headers)
        .bind(p.value)
        .bind(p.available_at)
        .bind(p.now)
        .bind(p.topic)
        .bind(p.partition)
        .fetch_one(self.pool())
        .await?;

        Ok(offset)
    }

    /// Records of a partition starting at `from_offset`, in offset order.
    pub async fn fetch_records(
        &self,
        topic: &str,
        partition: i64,
        from_offset: i64,
        limit: u32,
    ) -> Result<Vec<StoredRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, StoredRecord>(
            "SELECT record_offset, record_key, headers, value, available_at \
             FROM bus_records \
             WHERE topic = ? AND partition_id = ? AND record_offset >= ? \
             ORDER BY record_offset ASC LIMIT ?",
        )
        .bind(topic)
        .bind(partition)
        .bind(from_offset)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    // =========================================================================
    // Offset queries
    // =========================================================================

    /// Next offset to read for a group, or `None` for a fresh group.
    pub async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT committed_offset FROM bus_group_offsets \
             WHERE group_id = ? AND topic = ? AND partition_id = ?",
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(o,)| o))
    }

    /// Record `next_offset` as the group's position. Never moves backwards.
    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i64,
        next_offset: i64,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO bus_group_offsets (group_id, topic, partition_id, committed_offset, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET \
             committed_offset = MAX(bus_group_offsets.committed_offset, excluded.committed_offset), \
             updated_at = excluded.updated_at",
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(next_offset)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // =========================================================================
    // Membership queries
    // =========================================================================

    pub async fn heartbeat_member(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO bus_group_members (group_id, topic, member_id, heartbeat_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(group_id, topic, member_id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
        )
        .bind(group)
        .bind(topic)
        .bind(member_id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Drop members whose heartbeat is older than `cutoff` and return the
    /// number still alive.
    pub async fn live_members(
        &self,
        group: &str,
        topic: &str,
        cutoff: i64,
    ) -> Result<u32, DatabaseError> {
        sqlx::query(
            "DELETE FROM bus_group_members WHERE group_id = ? AND topic = ? AND heartbeat_at < ?",
        )
        .bind(group)
        .bind(topic)
        .bind(cutoff)
        .execute(self.pool())
        .await?;

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bus_group_members WHERE group_id = ? AND topic = ?",
        )
        .bind(group)
        .bind(topic)
        .fetch_one(self.pool())
        .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn remove_member(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM bus_group_members WHERE group_id = ? AND topic = ? AND member_id = ?")
            .bind(group)
            .bind(topic)
            .bind(member_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Lease queries
    // =========================================================================

    /// Extend every lease held by `member_id` and return the partitions it
    /// still owns, ascending.
    pub async fn renew_leases(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "UPDATE bus_partition_leases SET expires_at = ? \
             WHERE group_id = ? AND topic = ? AND member_id = ? AND expires_at > ? \
             RETURNING partition_id",
        )
        .bind(expires_at)
        .bind(group)
        .bind(topic)
        .bind(member_id)
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        let mut owned: Vec<i64> = rows.into_iter().map(|(p,)| p).collect();
        owned.sort_unstable();
        Ok(owned)
    }

    /// Take a partition if it is free, expired, or already ours.
    ///
    /// Returns `true` if `member_id` holds the lease afterwards.
    pub async fn try_claim_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i64,
        member_id: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO bus_partition_leases (group_id, topic, partition_id, member_id, expires_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET \
             member_id = excluded.member_id, expires_at = excluded.expires_at \
             WHERE bus_partition_leases.expires_at <= ? \
             OR bus_partition_leases.member_id = excluded.member_id",
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(member_id)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i64,
        member_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "DELETE FROM bus_partition_leases \
             WHERE group_id = ? AND topic = ? AND partition_id = ? AND member_id = ?",
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn release_all_partitions(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM bus_partition_leases WHERE group_id = ? AND topic = ? AND member_id = ?",
        )
        .bind(group)
        .bind(topic)
        .bind(member_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

//! One consumer-group member: heartbeats, partition leases, and the
//! fetch/dispatch/commit loop.

use std::sync::Arc;
use std::time::Instant;

use citewalk_core::db::{DatabaseError, unix_timestamp_millis};
use futures::StreamExt;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::event_bus::{BusMessage, EventHandler};
use crate::record;
use crate::sqlite::BusOptions;
use crate::storage::{BusDatabase, StoredRecord};

#[allow(clippy::cast_possible_truncation)]
const fn millis(d: std::time::Duration) -> i64 {
    d.as_millis() as i64
}

/// Partitions this member may read, and how long that claim holds without
/// another successful renewal.
#[derive(Debug, Clone)]
struct Leases {
    partitions: Vec<i64>,
    valid_until: Instant,
}

impl Leases {
    fn holds(&self, partition: i64) -> bool {
        Instant::now() < self.valid_until && self.partitions.contains(&partition)
    }
}

pub struct Consumer {
    pub db: BusDatabase,
    pub topic: String,
    pub group: String,
    pub member_id: String,
    pub partitions: u32,
    pub concurrency: usize,
    pub handler: Arc<dyn EventHandler>,
    pub options: BusOptions,
    pub wake: Arc<Notify>,
    pub shutdown: watch::Receiver<bool>,
}

impl Consumer {
    pub async fn run(mut self) {
        info!(
            topic = %self.topic,
            group = %self.group,
            member = %self.member_id,
            "Consumer started"
        );

        let leases = watch::Sender::new(Leases {
            partitions: Vec::new(),
            valid_until: Instant::now(),
        });
        let mut last_rebalance: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if last_rebalance.is_none_or(|t| t.elapsed() >= self.options.heartbeat_interval) {
                let started = Instant::now();
                match self.rebalance().await {
                    Ok(assigned) => {
                        if assigned != leases.borrow().partitions {
                            info!(
                                topic = %self.topic,
                                group = %self.group,
                                partitions = ?assigned,
                                "Partition assignment changed"
                            );
                        }
                        leases.send_replace(Leases {
                            partitions: assigned,
                            valid_until: started + self.options.session_timeout,
                        });
                    }
                    Err(e) => {
                        warn!(topic = %self.topic, group = %self.group, error = %e, "Rebalance failed");
                    }
                }
                last_rebalance = Some(Instant::now());
            }

            if self.poll_owned(&leases).await {
                continue;
            }

            tokio::select! {
                () = self.wake.notified() => {}
                () = tokio::time::sleep(self.options.poll_interval) => {}
                res = self.shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        self.leave().await;
    }

    /// Heartbeat, then converge on a fair share of the partitions.
    async fn rebalance(&self) -> Result<Vec<i64>, DatabaseError> {
        let now = unix_timestamp_millis();
        let session = millis(self.options.session_timeout);
        let expires_at = now + session;

        self.db
            .heartbeat_member(&self.group, &self.topic, &self.member_id, now)
            .await?;
        let live = self
            .db
            .live_members(&self.group, &self.topic, now - session)
            .await?
            .max(1);
        let share = self.partitions.div_ceil(live) as usize;

        let mut owned = self
            .db
            .renew_leases(&self.group, &self.topic, &self.member_id, now, expires_at)
            .await?;

        while owned.len() > share {
            if let Some(p) = owned.pop() {
                self.db
                    .release_partition(&self.group, &self.topic, p, &self.member_id)
                    .await?;
                debug!(topic = %self.topic, partition = p, "Released partition over fair share");
            }
        }

        for p in 0..i64::from(self.partitions) {
            if owned.len() >= share {
                break;
            }
            if owned.contains(&p) {
                continue;
            }
            if self
                .db
                .try_claim_partition(&self.group, &self.topic, p, &self.member_id, now, expires_at)
                .await?
            {
                owned.push(p);
            }
        }

        owned.sort_unstable();
        Ok(owned)
    }

    /// Drain owned partitions, `concurrency` at a time, renewing the
    /// membership and leases while handlers run. Returns `true` if any record
    /// was handled.
    async fn poll_owned(&self, leases: &watch::Sender<Leases>) -> bool {
        let owned = leases.borrow().partitions.clone();
        if owned.is_empty() {
            return false;
        }

        let drain = futures::stream::iter(owned)
            .map(|p| self.drain_partition(p, leases))
            .buffer_unordered(self.concurrency.max(1))
            .collect::<Vec<bool>>();
        tokio::pin!(drain);

        let every = self.options.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                results = &mut drain => return results.into_iter().any(|handled| handled),
                _ = ticker.tick() => self.keep_alive(leases).await,
            }
        }
    }

    /// Heartbeat and extend the leases we still hold. Claims and releases
    /// wait for the next rebalance, when no partition is being drained.
    async fn keep_alive(&self, leases: &watch::Sender<Leases>) {
        let started = Instant::now();
        let now = unix_timestamp_millis();
        let expires_at = now + millis(self.options.session_timeout);

        let renewed = match self
            .db
            .heartbeat_member(&self.group, &self.topic, &self.member_id, now)
            .await
        {
            Ok(()) => {
                self.db
                    .renew_leases(&self.group, &self.topic, &self.member_id, now, expires_at)
                    .await
            }
            Err(e) => Err(e),
        };

        match renewed {
            Ok(renewed) => {
                leases.send_modify(|l| {
                    l.partitions.retain(|p| {
                        let kept = renewed.contains(p);
                        if !kept {
                            warn!(topic = %self.topic, partition = *p, "Lease lost mid-drain");
                        }
                        kept
                    });
                    l.valid_until = started + self.options.session_timeout;
                });
            }
            Err(e) => {
                warn!(topic = %self.topic, group = %self.group, error = %e, "Lease renewal failed");
            }
        }
    }

    async fn drain_partition(&self, partition: i64, leases: &watch::Sender<Leases>) -> bool {
        let from = match self
            .db
            .committed_offset(&self.group, &self.topic, partition)
            .await
        {
            // A fresh group starts at the earliest retained record.
            Ok(offset) => offset.unwrap_or(0),
            Err(e) => {
                warn!(topic = %self.topic, partition, error = %e, "Failed to read committed offset");
                return false;
            }
        };

        let records = match self
            .db
            .fetch_records(&self.topic, partition, from, self.options.batch_size)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(topic = %self.topic, partition, error = %e, "Failed to fetch records");
                return false;
            }
        };

        let mut handled = false;
        for rec in records {
            if *self.shutdown.borrow() {
                break;
            }
            // Another member may own the partition now.
            if !leases.borrow().holds(partition) {
                debug!(topic = %self.topic, partition, "Stopping drain without a live lease");
                break;
            }
            // Never skip past a delayed record; partition order must hold.
            if rec.available_at > unix_timestamp_millis() {
                break;
            }

            let next = rec.record_offset + 1;
            self.dispatch(partition, rec).await;

            if let Err(e) = self
                .db
                .commit_offset(&self.group, &self.topic, partition, next, unix_timestamp_millis())
                .await
            {
                // The record will be redelivered.
                warn!(topic = %self.topic, partition, error = %e, "Failed to commit offset");
                return handled;
            }
            handled = true;
        }
        handled
    }

    async fn dispatch(&self, partition: i64, rec: StoredRecord) {
        let offset = rec.record_offset;
        let message = match decode(&self.topic, partition, rec) {
            Ok(m) => m,
            Err(e) => {
                error!(topic = %self.topic, partition, offset, error = %e, "Skipping undecodable record");
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        let outcome = tokio::spawn(async move { handler.handle(message).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    topic = %self.topic,
                    partition,
                    offset,
                    error = %e,
                    "Error processing message on {}[{}]",
                    self.topic,
                    partition
                );
            }
            Err(e) => {
                error!(topic = %self.topic, partition, offset, error = %e, "Handler panicked");
            }
        }
    }

    async fn leave(&self) {
        match self
            .db
            .release_all_partitions(&self.group, &self.topic, &self.member_id)
            .await
        {
            Ok(n) => debug!(topic = %self.topic, released = n, "Released partitions"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Failed to release partitions"),
        }
        if let Err(e) = self
            .db
            .remove_member(&self.group, &self.topic, &self.member_id)
            .await
        {
            warn!(topic = %self.topic, error = %e, "Failed to deregister consumer");
        }
        info!(topic = %self.topic, group = %self.group, member = %self.member_id, "Consumer stopped");
    }
}

fn decode(
    topic: &str,
    partition: i64,
    rec: StoredRecord,
) -> Result<BusMessage, crate::error::BusError> {
    let partition = u32::try_from(partition).unwrap_or_default();
    record::decode(
        topic,
        partition,
        rec.record_offset,
        rec.record_key,
        &rec.headers,
        &rec.value,
    )
}

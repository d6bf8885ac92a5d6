//! Delivery worker: turns a push job into provider sends.
//!
//! Jobs are delivered at least once, so every step starts from the outbox
//! row's status and a row that is no longer PENDING is left untouched.

use std::sync::Arc;
use std::time::Duration;

use citewalk_bus::{BusMessage, EventBus, HandlerResult, SubscribeOptions, handler_fn};
use citewalk_core::db::unix_timestamp_millis;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::error::PushError;
use crate::outbox::{PUSH_TOPIC, PushJob};
use crate::senders::{PushMessage, SendOutcome, SenderRegistry};
use crate::storage::{DeviceRegistration, OutboxItem, OutboxStatus, PushDatabase};
use crate::tokens::{TokenStore, token_prefix};

/// Reason recorded on items whose recipient has no active devices.
pub const NO_ACTIVE_TOKENS: &str = "no active tokens";

/// Per-device tally of one delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub failed: usize,
    pub disabled: usize,
}

/// What processing a job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No outbox row with that id.
    Missing,
    /// The row had already left PENDING; nothing was sent.
    AlreadyProcessed(OutboxStatus),
    /// The recipient had no active devices.
    Suppressed,
    Sent(DeliverySummary),
}

#[derive(Clone)]
pub struct PushWorker {
    db: PushDatabase,
    tokens: TokenStore,
    senders: SenderRegistry,
    send_timeout: Duration,
}

impl PushWorker {
    pub fn new(
        db: PushDatabase,
        tokens: TokenStore,
        senders: SenderRegistry,
        send_timeout: Duration,
    ) -> Self {
        Self {
            db,
            tokens,
            senders,
            send_timeout,
        }
    }

    /// Subscribe to the job topic with `concurrency` partitions in flight.
    pub async fn start(
        self,
        bus: &dyn EventBus,
        concurrency: usize,
    ) -> Result<(), PushError> {
        let worker = Arc::new(self);
        let handler = handler_fn(move |message: BusMessage| {
            let worker = Arc::clone(&worker);
            async move { worker.handle(message).await }
        });

        bus.subscribe(
            PUSH_TOPIC,
            handler,
            SubscribeOptions::default().with_concurrency(concurrency.max(1)),
        )
        .await?;
        info!(topic = PUSH_TOPIC, concurrency, "Push worker subscribed");
        Ok(())
    }

    async fn handle(&self, message: BusMessage) -> HandlerResult {
        let job: PushJob = serde_json::from_value(message.data)?;
        self.process(&job.id).await?;
        Ok(())
    }

    /// Deliver one outbox item to every active device of its recipient.
    #[instrument(skip(self), fields(outbox_id = %id))]
    pub async fn process(&self, id: &str) -> Result<ProcessOutcome, PushError> {
        let Some(item) = self.db.get_outbox_item(id).await? else {
            debug!("Outbox item not found; dropping job");
            return Ok(ProcessOutcome::Missing);
        };
        if item.status != OutboxStatus::Pending {
            debug!(status = %item.status, "Outbox item already processed");
            return Ok(ProcessOutcome::AlreadyProcessed(item.status));
        }

        match self.deliver(&item).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "Push delivery step failed; marking item failed");
                if let Err(mark_err) = self.db.mark_outbox_failed(&item.id, &e.to_string()).await {
                    warn!(error = %mark_err, "Failed to mark outbox item failed");
                }
                Err(e)
            }
        }
    }

    async fn deliver(&self, item: &OutboxItem) -> Result<ProcessOutcome, PushError> {
        let devices = self.tokens.active_for_user(&item.recipient_id).await?;
        if devices.is_empty() {
            if !self
                .db
                .mark_outbox_suppressed(&item.id, NO_ACTIVE_TOKENS)
                .await?
            {
                return self.settled_elsewhere(&item.id).await;
            }
            info!(recipient_id = %item.recipient_id, "No active devices; notification suppressed");
            return Ok(ProcessOutcome::Suppressed);
        }

        let message = PushMessage {
            title: item.title.clone(),
            body: item.body.clone(),
            data: item.payload.0.clone(),
            priority: item.priority,
        };

        let outcomes = join_all(devices.iter().map(|d| self.send_one(d, &message))).await;

        let mut summary = DeliverySummary::default();
        for (device, outcome) in devices.iter().zip(outcomes) {
            match outcome {
                SendOutcome::Delivered => summary.delivered += 1,
                SendOutcome::Failed { reason } => {
                    summary.failed += 1;
                    warn!(
                        registration_id = %device.id,
                        provider = %device.provider,
                        reason = %reason,
                        "Push send failed"
                    );
                }
                SendOutcome::InvalidToken { reason } => {
                    summary.failed += 1;
                    // One dead device must not affect the others.
                    match self.tokens.disable(&device.id).await {
                        Ok(true) => {
                            summary.disabled += 1;
                            info!(
                                registration_id = %device.id,
                                provider = %device.provider,
                                reason = %reason,
                                "Disabled invalid device token"
                            );
                        }
                        Ok(false) => {}
                        Err(e) => warn!(
                            registration_id = %device.id,
                            error = %e,
                            "Failed to disable invalid device token"
                        ),
                    }
                }
            }
        }

        if !self
            .db
            .mark_outbox_sent(&item.id, unix_timestamp_millis())
            .await?
        {
            return self.settled_elsewhere(&item.id).await;
        }
        info!(
            delivered = summary.delivered,
            failed = summary.failed,
            disabled = summary.disabled,
            "Notification sent"
        );
        Ok(ProcessOutcome::Sent(summary))
    }

    /// The row left PENDING while this copy of the job was working on it.
    async fn settled_elsewhere(&self, id: &str) -> Result<ProcessOutcome, PushError> {
        match self.db.get_outbox_item(id).await? {
            Some(item) => {
                debug!(status = %item.status, "Outbox item settled by another delivery");
                Ok(ProcessOutcome::AlreadyProcessed(item.status))
            }
            None => Ok(ProcessOutcome::Missing),
        }
    }

    async fn send_one(&self, device: &DeviceRegistration, message: &PushMessage) -> SendOutcome {
        let token = match self.tokens.reveal_token(device) {
            Ok(t) => t,
            Err(e) => return SendOutcome::failed(format!("token decryption failed: {e}")),
        };

        let sender = self.senders.for_provider(device.provider);
        match tokio::time::timeout(
            self.send_timeout,
            sender.send(&token, message, device.provider_environment),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(token_prefix = token_prefix(&token), "Push send timed out");
                SendOutcome::failed(format!("send timed out after {:?}", self.send_timeout))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use citewalk_crypto::FieldCipher;

    use super::*;
    use crate::senders::PushSender;
    use crate::storage::{NewOutboxRow, Platform, Priority, Provider, ProviderEnvironment};
    use crate::tokens::RegisterDevice;

    const KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    /// Answers per token; unknown tokens are delivered. Records every call.
    struct FakeSender {
        provider: Provider,
        outcomes: HashMap<String, SendOutcome>,
        delay: Option<Duration>,
        calls: Mutex<Vec<(String, Option<ProviderEnvironment>)>>,
        /// Outbox row another worker marks sent while this send is in flight.
        settled_by_peer: Mutex<Option<(PushDatabase, String)>>,
    }

    impl FakeSender {
        fn new(provider: Provider) -> Self {
            Self {
                provider,
                outcomes: HashMap::new(),
                delay: None,
                calls: Mutex::new(Vec::new()),
                settled_by_peer: Mutex::new(None),
            }
        }

        fn answering(mut self, token: &str, outcome: SendOutcome) -> Self {
            self.outcomes.insert(token.to_string(), outcome);
            self
        }

        fn calls(&self) -> Vec<(String, Option<ProviderEnvironment>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushSender for FakeSender {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn send(
            &self,
            token: &str,
            _message: &PushMessage,
            environment: Option<ProviderEnvironment>,
        ) -> SendOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((token.to_string(), environment));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let peer = self.settled_by_peer.lock().unwrap().take();
            if let Some((db, id)) = peer {
                assert!(db.mark_outbox_sent(&id, unix_timestamp_millis()).await.unwrap());
            }
            self.outcomes
                .get(token)
                .cloned()
                .unwrap_or(SendOutcome::Delivered)
        }
    }

    struct Harness {
        db: PushDatabase,
        tokens: TokenStore,
        apple: Arc<FakeSender>,
        google: Arc<FakeSender>,
        worker: PushWorker,
    }

    async fn harness(apple: FakeSender, google: FakeSender) -> Harness {
        let db = PushDatabase::open_in_memory().await.unwrap();
        let cipher = Arc::new(FieldCipher::new(Some(KEY)).unwrap());
        let tokens = TokenStore::new(db.clone(), cipher);
        let apple = Arc::new(apple);
        let google = Arc::new(google);
        let senders = SenderRegistry::new(
            Arc::clone(&apple) as Arc<dyn PushSender>,
            Arc::clone(&google) as Arc<dyn PushSender>,
        );
        let worker = PushWorker::new(
            db.clone(),
            tokens.clone(),
            senders,
            Duration::from_millis(200),
        );
        Harness {
            db,
            tokens,
            apple,
            google,
            worker,
        }
    }

    async fn register(h: &Harness, user: &str, provider: Provider, token: &str) -> String {
        let platform = match provider {
            Provider::Apple => Platform::Ios,
            Provider::Google => Platform::Android,
        };
        h.tokens
            .register(&RegisterDevice {
                user_id: user.to_string(),
                provider,
                token: token.to_string(),
                platform,
                device_id: None,
                app_version: None,
                locale: None,
                environment: (provider == Provider::Apple).then_some(ProviderEnvironment::Sandbox),
            })
            .await
            .unwrap()
            .id
    }

    async fn outbox_item(h: &Harness, id: &str, recipient: &str) {
        h.db.insert_outbox_item(&NewOutboxRow {
            id,
            recipient_id: recipient,
            kind: "mention",
            title: "T",
            body: "B",
            payload: &BTreeMap::new(),
            priority: Priority::Normal,
            now: unix_timestamp_millis(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn single_apple_device_is_sent() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        register(&h, "U", Provider::Apple, "abc").await;
        outbox_item(&h, "n1", "U").await;

        let outcome = h.worker.process("n1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Sent(DeliverySummary {
                delivered: 1,
                failed: 0,
                disabled: 0
            })
        );

        let item = h.db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Sent);
        assert!(item.sent_at.is_some());
        assert_eq!(item.attempt_count, 1);

        // The sender sees the decrypted token and the stored environment.
        assert_eq!(
            h.apple.calls(),
            vec![("abc".to_string(), Some(ProviderEnvironment::Sandbox))]
        );
        assert!(h.google.calls().is_empty());
    }

    #[tokio::test]
    async fn no_devices_suppresses_without_sending() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        outbox_item(&h, "n1", "U").await;

        assert_eq!(
            h.worker.process("n1").await.unwrap(),
            ProcessOutcome::Suppressed
        );
        let item = h.db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Suppressed);
        assert_eq!(item.last_error.as_deref(), Some(NO_ACTIVE_TOKENS));
        assert!(h.apple.calls().is_empty());
        assert!(h.google.calls().is_empty());
    }

    #[tokio::test]
    async fn reprocessing_sent_item_is_a_no_op() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        register(&h, "U", Provider::Apple, "abc").await;
        outbox_item(&h, "n1", "U").await;
        h.worker.process("n1").await.unwrap();
        let before = h.db.get_outbox_item("n1").await.unwrap().unwrap();

        assert_eq!(
            h.worker.process("n1").await.unwrap(),
            ProcessOutcome::AlreadyProcessed(OutboxStatus::Sent)
        );
        let after = h.db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(h.apple.calls().len(), 1);
        assert_eq!(after.attempt_count, before.attempt_count);
        assert_eq!(after.sent_at, before.sent_at);
    }

    #[tokio::test]
    async fn item_settled_by_a_concurrent_copy_is_not_reported_sent() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        register(&h, "U", Provider::Apple, "abc").await;
        outbox_item(&h, "n1", "U").await;
        *h.apple.settled_by_peer.lock().unwrap() = Some((h.db.clone(), "n1".to_string()));

        assert_eq!(
            h.worker.process("n1").await.unwrap(),
            ProcessOutcome::AlreadyProcessed(OutboxStatus::Sent)
        );
        // Only the peer's transition counted.
        let item = h.db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Sent);
        assert_eq!(item.attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_item_is_done() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        assert_eq!(
            h.worker.process("ghost").await.unwrap(),
            ProcessOutcome::Missing
        );
    }

    #[tokio::test]
    async fn invalid_token_disables_only_that_device() {
        let h = harness(
            FakeSender::new(Provider::Apple)
                .answering("dead", SendOutcome::invalid_token("Unregistered")),
            FakeSender::new(Provider::Google),
        )
        .await;
        let dead = register(&h, "U", Provider::Apple, "dead").await;
        let alive = register(&h, "U", Provider::Apple, "alive").await;
        let android = register(&h, "U", Provider::Google, "droid").await;
        outbox_item(&h, "n1", "U").await;

        let outcome = h.worker.process("n1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Sent(DeliverySummary {
                delivered: 2,
                failed: 1,
                disabled: 1
            })
        );

        assert!(h.db.get_device(&dead).await.unwrap().unwrap().disabled_at.is_some());
        assert!(h.db.get_device(&alive).await.unwrap().unwrap().is_active());
        assert!(h.db.get_device(&android).await.unwrap().unwrap().is_active());
        assert_eq!(h.apple.calls().len(), 2);
        assert_eq!(h.google.calls(), vec![("droid".to_string(), None)]);
    }

    #[tokio::test]
    async fn transient_failure_keeps_device_and_item_is_sent() {
        let h = harness(
            FakeSender::new(Provider::Apple)
                .answering("flaky", SendOutcome::failed("APNs 503: ServiceUnavailable")),
            FakeSender::new(Provider::Google),
        )
        .await;
        let flaky = register(&h, "U", Provider::Apple, "flaky").await;
        outbox_item(&h, "n1", "U").await;

        let outcome = h.worker.process("n1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Sent(s) if s.failed == 1 && s.disabled == 0));
        assert!(h.db.get_device(&flaky).await.unwrap().unwrap().is_active());
        assert_eq!(
            h.db.get_outbox_item("n1").await.unwrap().unwrap().status,
            OutboxStatus::Sent
        );
    }

    #[tokio::test]
    async fn timed_out_send_is_failed_not_invalid() {
        let mut slow = FakeSender::new(Provider::Google);
        slow.delay = Some(Duration::from_secs(5));
        let h = harness(FakeSender::new(Provider::Apple), slow).await;
        let device = register(&h, "U", Provider::Google, "slow").await;
        outbox_item(&h, "n1", "U").await;

        let outcome = h.worker.process("n1").await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Sent(DeliverySummary {
                delivered: 0,
                failed: 1,
                disabled: 0
            })
        );
        assert!(h.db.get_device(&device).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn database_failure_marks_item_failed_when_possible() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        outbox_item(&h, "n1", "U").await;
        sqlx::query("DROP TABLE device_registrations")
            .execute(h.db.pool())
            .await
            .unwrap();

        let err = h.worker.process("n1").await.unwrap_err();
        assert!(matches!(err, PushError::Database(_)));

        let item = h.db.get_outbox_item("n1").await.unwrap().unwrap();
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(item.attempt_count, 1);
        assert!(item.last_error.is_some());
    }

    #[tokio::test]
    async fn handler_rejects_malformed_job() {
        let h = harness(FakeSender::new(Provider::Apple), FakeSender::new(Provider::Google)).await;
        let message = BusMessage {
            topic: PUSH_TOPIC.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            event: crate::outbox::PUSH_JOB_EVENT.to_string(),
            data: serde_json::json!({ "unexpected": true }),
            timestamp: 0,
            priority: None,
        };
        assert!(h.worker.handle(message).await.is_err());
    }
}

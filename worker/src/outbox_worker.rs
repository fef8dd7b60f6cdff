//! The outbox delivery loop.
//!
//! The worker claims batches of due messages, attempts delivery through a
//! [`DeliveryPort`], and writes the outcome back: sent, rescheduled with
//! backoff, or permanently failed. Delivery is at-least-once; duplicates
//! across crashes are expected and consumers deduplicate by message id.
//!
//! A failure to update one message is logged and never takes the loop
//! down; the message's claim lease expires and it is retried later.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use tablehold_core::{Clock, DeliveryOutcome, DeliveryPort, OutboxError, OutboxMessage, OutboxStore};
use tablehold_runtime::RetryPolicy;
use tablehold_runtime::metrics::OutboxMetrics;

const DEFAULT_BATCH_SIZE: i64 = 50;
const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Outbox worker configuration.
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Maximum messages claimed per iteration
    pub batch_size: i64,
    /// Sleep between iterations when the outbox is empty
    pub idle_sleep: Duration,
    /// Restrict this worker to the given topics; `None` takes everything
    pub topics: Option<Vec<String>>,
    /// Backoff schedule for rescheduled deliveries
    pub retry: RetryPolicy,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            topics: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboxWorkerConfig {
    /// Read a configuration from the environment with defaults.
    ///
    /// Variables: `OUTBOX_BATCH_SIZE`, `OUTBOX_IDLE_SLEEP_MS`,
    /// `OUTBOX_TOPICS` (comma-separated), plus the `OUTBOX_SEND_*` retry
    /// policy variables.
    #[must_use]
    pub fn from_env() -> Self {
        let topics = std::env::var("OUTBOX_TOPICS").ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        Self {
            batch_size: std::env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            idle_sleep: std::env::var("OUTBOX_IDLE_SLEEP_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(DEFAULT_IDLE_SLEEP, Duration::from_millis),
            topics: topics.filter(|t| !t.is_empty()),
            retry: RetryPolicy::from_env("OUTBOX_SEND"),
        }
    }
}

/// Drains the outbox through a delivery port.
pub struct OutboxWorker<S, D> {
    store: S,
    delivery: D,
    config: OutboxWorkerConfig,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore, D: DeliveryPort> OutboxWorker<S, D> {
    /// Create a worker.
    pub fn new(store: S, delivery: D, config: OutboxWorkerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            delivery,
            config,
            clock,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Busy iterations loop back immediately; an empty or failed iteration
    /// sleeps `idle_sleep`, interruptible by shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            topics = ?self.config.topics,
            "outbox worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(0) => self.idle(&mut shutdown).await,
                Ok(processed) => {
                    tracing::debug!(processed, "outbox batch processed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "outbox batch failed");
                    self.idle(&mut shutdown).await;
                }
            }
        }
        tracing::info!("outbox worker stopped");
    }

    /// Claim and process one batch. Returns the number of claimed messages.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] only when claiming fails; per-message update
    /// failures are logged and swallowed.
    pub async fn run_once(&self) -> Result<usize, OutboxError> {
        let batch = match &self.config.topics {
            Some(topics) => {
                self.store
                    .pick_batch_for_topics(topics, self.config.batch_size)
                    .await?
            }
            None => self.store.pick_batch(self.config.batch_size).await?,
        };
        let claimed = batch.len();
        for message in batch {
            self.process(message).await;
        }
        Ok(claimed)
    }

    async fn process(&self, message: OutboxMessage) {
        let started = Instant::now();
        let outcome = self.delivery.send(&message.topic, &message.payload).await;

        let update = match outcome {
            DeliveryOutcome::Delivered => {
                OutboxMetrics::record_sent(started.elapsed());
                tracing::debug!(outbox_id = message.id, topic = %message.topic, "message delivered");
                self.store.mark_sent(message.id).await
            }
            DeliveryOutcome::Retryable {
                status,
                retry_after,
            } => {
                OutboxMetrics::record_retried();
                let attempt = u32::try_from(message.attempts).unwrap_or(u32::MAX);
                let delay = retry_after
                    .unwrap_or_else(|| self.config.retry.delay_for_attempt(attempt + 1));
                let next_attempt_at = self.clock.now()
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
                tracing::warn!(
                    outbox_id = message.id,
                    topic = %message.topic,
                    status = ?status,
                    delay = ?delay,
                    "delivery failed transiently, rescheduling"
                );
                self.store
                    .mark_failed_with_retry(
                        message.id,
                        &retry_error_label(status),
                        next_attempt_at,
                    )
                    .await
            }
            DeliveryOutcome::Permanent { status, body } => {
                OutboxMetrics::record_failed();
                tracing::error!(
                    outbox_id = message.id,
                    topic = %message.topic,
                    status,
                    "delivery rejected permanently"
                );
                self.store
                    .mark_failed_permanently(message.id, &format!("HTTP {status}: {body}"))
                    .await
            }
        };

        if let Err(e) = update {
            // The claim lease will expire and the message will be retried.
            tracing::error!(outbox_id = message.id, error = %e, "failed to record delivery outcome");
        }
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(self.config.idle_sleep) => {}
        }
    }
}

fn retry_error_label(status: Option<u16>) -> String {
    match status {
        Some(status) => format!("HTTP {status}"),
        None => "transport error".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use tablehold_core::{ManualClock, OutboxStatus};

    /// Store double tracking messages in memory.
    struct InMemoryStore {
        clock: Arc<ManualClock>,
        messages: Mutex<Vec<OutboxMessage>>,
    }

    impl InMemoryStore {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                messages: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, id: i64, topic: &str) {
            self.messages.lock().unwrap().push(OutboxMessage {
                id,
                topic: topic.to_string(),
                payload: json!({"id": id}),
                status: OutboxStatus::New,
                attempts: 0,
                next_attempt_at: self.clock.now(),
                last_error: None,
            });
        }

        fn get(&self, id: i64) -> OutboxMessage {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .expect("message exists")
        }

        fn due(&self, topics: Option<&[String]>, limit: i64) -> Vec<OutboxMessage> {
            let now = self.clock.now();
            let messages = self.messages.lock().unwrap();
            messages
                .iter()
                .filter(|m| m.status == OutboxStatus::New && m.next_attempt_at <= now)
                .filter(|m| topics.is_none_or(|t| t.contains(&m.topic)))
                .take(usize::try_from(limit).unwrap())
                .cloned()
                .collect()
        }

        fn update(&self, id: i64, f: impl FnOnce(&mut OutboxMessage)) -> Result<(), OutboxError> {
            let mut messages = self.messages.lock().unwrap();
            let message = messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(OutboxError::NotFound(id))?;
            f(message);
            Ok(())
        }
    }

    impl OutboxStore for InMemoryStore {
        fn pick_batch(
            &self,
            limit: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>>
        {
            Box::pin(async move { Ok(self.due(None, limit)) })
        }

        fn pick_batch_for_topics<'a>(
            &'a self,
            topics: &'a [String],
            limit: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + 'a>>
        {
            Box::pin(async move { Ok(self.due(Some(topics), limit)) })
        }

        fn mark_sent(
            &self,
            id: i64,
        ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
            Box::pin(async move {
                self.update(id, |m| {
                    if m.status == OutboxStatus::New {
                        m.status = OutboxStatus::Sent;
                        m.attempts += 1;
                    }
                })
            })
        }

        fn mark_failed_with_retry<'a>(
            &'a self,
            id: i64,
            error: &'a str,
            next_attempt_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
            Box::pin(async move {
                self.update(id, |m| {
                    m.attempts += 1;
                    m.next_attempt_at = next_attempt_at;
                    m.last_error = Some(error.to_string());
                })
            })
        }

        fn mark_failed_permanently<'a>(
            &'a self,
            id: i64,
            error: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
            Box::pin(async move {
                self.update(id, |m| {
                    if m.status == OutboxStatus::New {
                        m.status = OutboxStatus::Failed;
                        m.attempts += 1;
                        m.last_error = Some(error.to_string());
                    }
                })
            })
        }
    }

    /// Delivery double replaying scripted outcomes.
    struct ScriptedDelivery {
        outcomes: Mutex<VecDeque<DeliveryOutcome>>,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedDelivery {
        fn new(outcomes: Vec<DeliveryOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_topics(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(t, _)| t.clone())
                .collect()
        }
    }

    impl DeliveryPort for ScriptedDelivery {
        fn send<'a>(
            &'a self,
            topic: &'a str,
            payload: &'a Value,
        ) -> Pin<Box<dyn Future<Output = DeliveryOutcome> + Send + 'a>> {
            Box::pin(async move {
                self.sent
                    .lock()
                    .unwrap()
                    .push((topic.to_string(), payload.clone()));
                self.outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("script exhausted")
            })
        }
    }

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()))
    }

    fn no_jitter_config() -> OutboxWorkerConfig {
        OutboxWorkerConfig {
            retry: RetryPolicy::builder()
                .base_backoff(Duration::from_millis(500))
                .max_backoff(Duration::from_secs(15))
                .jitter(Duration::ZERO)
                .build(),
            ..OutboxWorkerConfig::default()
        }
    }

    fn worker(
        clock: &Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        outcomes: Vec<DeliveryOutcome>,
    ) -> (Arc<ScriptedDelivery>, OutboxWorker<Arc<InMemoryStore>, Arc<ScriptedDelivery>>) {
        let delivery = Arc::new(ScriptedDelivery::new(outcomes));
        let worker = OutboxWorker::new(
            store,
            delivery.clone(),
            no_jitter_config(),
            clock.clone(),
        );
        (delivery, worker)
    }

    #[tokio::test]
    async fn delivered_messages_are_marked_sent() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        let (_delivery, worker) = worker(&clock, store.clone(), vec![DeliveryOutcome::Delivered]);

        assert_eq!(worker.run_once().await.unwrap(), 1);
        let message = store.get(1);
        assert_eq!(message.status, OutboxStatus::Sent);
        assert_eq!(message.attempts, 1);
    }

    #[tokio::test]
    async fn transient_failure_schedules_computed_backoff() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        let (_delivery, worker) = worker(
            &clock,
            store.clone(),
            vec![DeliveryOutcome::Retryable {
                status: Some(503),
                retry_after: None,
            }],
        );

        worker.run_once().await.unwrap();

        let message = store.get(1);
        assert_eq!(message.status, OutboxStatus::New);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.last_error.as_deref(), Some("HTTP 503"));
        // First retry waits base_backoff (500ms, no jitter).
        assert_eq!(
            message.next_attempt_at,
            clock.now() + ChronoDuration::milliseconds(500)
        );
    }

    #[tokio::test]
    async fn retry_after_hint_overrides_backoff() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        let (_delivery, worker) = worker(
            &clock,
            store.clone(),
            vec![DeliveryOutcome::Retryable {
                status: Some(429),
                retry_after: Some(Duration::from_secs(7)),
            }],
        );

        worker.run_once().await.unwrap();

        assert_eq!(
            store.get(1).next_attempt_at,
            clock.now() + ChronoDuration::seconds(7)
        );
    }

    #[tokio::test]
    async fn permanent_rejection_is_terminal() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        let (_delivery, worker) = worker(
            &clock,
            store.clone(),
            vec![DeliveryOutcome::Permanent {
                status: 400,
                body: "malformed".to_string(),
            }],
        );

        worker.run_once().await.unwrap();

        let message = store.get(1);
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.last_error.as_deref(), Some("HTTP 400: malformed"));

        // A terminal message never comes back.
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        store.push(2, "booking.seated");
        let (delivery, worker) = worker(
            &clock,
            store.clone(),
            vec![
                DeliveryOutcome::Retryable {
                    status: Some(503),
                    retry_after: None,
                },
                DeliveryOutcome::Delivered,
            ],
        );

        assert_eq!(worker.run_once().await.unwrap(), 2);
        assert_eq!(store.get(1).status, OutboxStatus::New);
        assert_eq!(store.get(2).status, OutboxStatus::Sent);
        assert_eq!(
            delivery.sent_topics(),
            vec!["booking.confirmed", "booking.seated"]
        );
    }

    #[tokio::test]
    async fn topic_restriction_is_honored() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store.push(1, "booking.confirmed");
        store.push(2, "booking.seated");

        let delivery = Arc::new(ScriptedDelivery::new(vec![DeliveryOutcome::Delivered]));
        let config = OutboxWorkerConfig {
            topics: Some(vec!["booking.seated".to_string()]),
            ..no_jitter_config()
        };
        let worker = OutboxWorker::new(store.clone(), delivery.clone(), config, clock.clone());

        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(delivery.sent_topics(), vec!["booking.seated"]);
        assert_eq!(store.get(1).status, OutboxStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_stops_promptly_on_shutdown() {
        let clock = test_clock();
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let (_delivery, worker) = worker(&clock, store, vec![]);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker must stop after shutdown")
            .expect("worker task must not panic");
    }
}

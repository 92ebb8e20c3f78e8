//! Pipeline workers
//!
//! Each stage is an [`EventHandler`] driven by a [`Worker`]: a durable
//! subscription loop with manual ack, a bounded handler deadline, dead
//! lettering and reconnect backoff.

pub mod delivery;
pub mod normalize;
pub mod reply;
pub mod responder;

pub use delivery::DeliveryStage;
pub use normalize::NormalizeStage;
pub use reply::ReplyStage;
pub use responder::ResponseStage;

use crate::config::WorkerConfig;
use crate::dlq::{should_dead_letter, DeadLetterEvent, DlqHandler};
use crate::error::{RelayError, Result};
use crate::events::PipelineEvent;
use crate::provider::PendingEvent;
use crate::store::EventBus;
use crate::types::SubscribeOptions;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One pipeline stage
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Payload consumed by this stage
    type Event: PipelineEvent;

    /// Durable consumer name, shared by every loop of the stage
    fn name(&self) -> &'static str;

    /// Process one event
    ///
    /// An error naks the event for redelivery, except malformed input which
    /// is dead-lettered. Long operations should stop when `cancel` fires.
    async fn handle(&self, event: Self::Event, cancel: CancellationToken) -> Result<()>;
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Retried,
    DeadLettered,
}

/// Subscription loop around an [`EventHandler`]
pub struct Worker<H: EventHandler> {
    handler: Arc<H>,
    bus: EventBus,
    dlq: Arc<dyn DlqHandler>,
    config: WorkerConfig,
}

impl<H: EventHandler> Worker<H> {
    pub fn new(handler: Arc<H>, bus: EventBus, dlq: Arc<dyn DlqHandler>, config: WorkerConfig) -> Self {
        Self {
            handler,
            bus,
            dlq,
            config,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Broker-side consumer settings
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            max_deliver: (self.config.max_deliver > 0).then_some(self.config.max_deliver as i64),
            backoff_secs: self.config.backoff_secs.clone(),
            ack_wait_secs: Some(self.config.handler_timeout_secs + self.config.cancel_grace_secs + 30),
            ..Default::default()
        }
    }

    /// Spawn `concurrency` loops that stop when `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|slot| {
                let worker = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(slot, shutdown).await })
            })
            .collect()
    }

    /// Subscribe and process until shutdown, reconnecting on failure
    pub async fn run(&self, slot: usize, shutdown: CancellationToken) {
        let name = self.handler.name();
        let topic = H::Event::TOPIC;
        let opts = self.subscribe_options();
        let mut attempts = 0u32;

        loop {
            let mut sub = tokio::select! {
                _ = shutdown.cancelled() => break,
                sub = self.bus.subscribe_durable(name, topic, &opts) => match sub {
                    Ok(s) => {
                        attempts = 0;
                        tracing::info!(worker = name, slot, topic, "Worker subscribed");
                        s
                    }
                    Err(e) => {
                        tracing::error!(worker = name, slot, error = %e, "Worker failed to subscribe");
                        if !self.backoff(&mut attempts, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(worker = name, slot, "Worker stopped");
                        return;
                    }
                    next = sub.next_manual_ack() => next,
                };
                match next {
                    Ok(Some(pending)) => {
                        self.process(pending, &shutdown).await;
                    }
                    Ok(None) => {
                        tracing::warn!(worker = name, slot, "Subscription closed, reconnecting");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(worker = name, slot, error = %e, "Receive error, reconnecting");
                        break;
                    }
                }
            }

            if !self.backoff(&mut attempts, &shutdown).await {
                break;
            }
        }
        tracing::info!(worker = name, slot, "Worker stopped");
    }

    /// Capped exponential sleep; false when shutdown fired first
    async fn backoff(&self, attempts: &mut u32, shutdown: &CancellationToken) -> bool {
        let delay = std::cmp::min(1u64 << (*attempts).min(16), self.config.reconnect_backoff_cap_secs);
        *attempts = attempts.saturating_add(1);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_secs(delay)) => true,
        }
    }

    /// Decode, handle and settle one delivery
    pub async fn process(&self, pending: PendingEvent, shutdown: &CancellationToken) -> Outcome {
        let name = self.handler.name();
        let received = pending.received.clone();
        let event_id = received.event.id.clone();

        let payload = match H::Event::from_event(&received.event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(worker = name, event_id = %event_id, error = %e, "Undecodable event");
                return self
                    .dead_letter(pending, format!("undecodable payload: {}", e))
                    .await;
            }
        };

        let cancel = shutdown.child_token();
        let result = self.handle_with_deadline(payload, &cancel, &event_id).await;

        match result {
            Ok(()) => {
                if let Err(e) = pending.ack().await {
                    tracing::warn!(worker = name, event_id = %event_id, error = %e, "Ack failed");
                }
                tracing::debug!(worker = name, event_id = %event_id, "Event handled");
                Outcome::Acked
            }
            Err(e) if e.is_malformed_input() => {
                tracing::error!(worker = name, event_id = %event_id, error = %e, "Event rejected");
                self.dead_letter(pending, e.to_string()).await
            }
            Err(e) if should_dead_letter(&received, self.config.max_deliver) => {
                tracing::error!(
                    worker = name,
                    event_id = %event_id,
                    num_delivered = received.num_delivered,
                    error = %e,
                    "Delivery attempts exhausted"
                );
                self.dead_letter(
                    pending,
                    format!("failed after {} attempts: {}", received.num_delivered, e),
                )
                .await
            }
            Err(e) => {
                tracing::warn!(
                    worker = name,
                    event_id = %event_id,
                    num_delivered = received.num_delivered,
                    error = %e,
                    "Event failed, requesting redelivery"
                );
                if let Err(e) = pending.nak().await {
                    tracing::warn!(worker = name, event_id = %event_id, error = %e, "Nak failed");
                }
                Outcome::Retried
            }
        }
    }

    /// Run the handler under the deadline
    ///
    /// When the deadline fires the token is cancelled and the handler keeps
    /// running for up to `cancel_grace` so it can settle its own state. Its
    /// result is used if it finishes in time.
    async fn handle_with_deadline(
        &self,
        payload: H::Event,
        cancel: &CancellationToken,
        event_id: &str,
    ) -> Result<()> {
        let name = self.handler.name();
        let timeout = self.config.handler_timeout();
        let handling = self.handler.handle(payload, cancel.clone());
        tokio::pin!(handling);

        tokio::select! {
            result = &mut handling => return result,
            _ = tokio::time::sleep(timeout) => {}
        }

        tracing::warn!(
            worker = name,
            event_id = %event_id,
            timeout_secs = timeout.as_secs(),
            "Handler deadline reached, cancelling"
        );
        cancel.cancel();
        match tokio::time::timeout(self.config.cancel_grace(), &mut handling).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(format!(
                "{} exceeded {}s handling {}",
                name,
                timeout.as_secs(),
                event_id
            ))),
        }
    }

    async fn dead_letter(&self, pending: PendingEvent, reason: String) -> Outcome {
        let name = self.handler.name();
        let dead = DeadLetterEvent::new(pending.received.clone(), name, reason);
        if let Err(e) = self.dlq.handle(dead).await {
            tracing::error!(worker = name, error = %e, "Dead letter handler failed, requesting redelivery");
            let _ = pending.nak().await;
            return Outcome::Retried;
        }
        if let Err(e) = pending.ack().await {
            tracing::warn!(worker = name, error = %e, "Ack of dead-lettered event failed");
        }
        Outcome::DeadLettered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MemoryDlqHandler;
    use crate::events::{new_event_id, MessageDelivery};
    use crate::domain::DeliveryMedium;
    use crate::provider::memory::MemoryProvider;
    use crate::types::Event;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` calls
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        error: fn() -> RelayError,
        sleep: Duration,
        ignore_cancel: bool,
        saw_cancel: AtomicBool,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                error: || RelayError::Service("database unavailable".into()),
                sleep: Duration::ZERO,
                ignore_cancel: false,
                saw_cancel: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        type Event = MessageDelivery;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _event: MessageDelivery, cancel: CancellationToken) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ignore_cancel {
                tokio::time::sleep(self.sleep).await;
            } else if !self.sleep.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.saw_cancel.store(true, Ordering::SeqCst);
                        return Err(RelayError::Cancelled("stopped".into()));
                    }
                    _ = tokio::time::sleep(self.sleep) => {}
                }
            }
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn delivery() -> MessageDelivery {
        MessageDelivery {
            event_id: new_event_id(),
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            medium: DeliveryMedium::Chat,
            channel_message_id: None,
            created_at: Utc::now(),
        }
    }

    fn worker(handler: Flaky, config: WorkerConfig) -> (Arc<Worker<Flaky>>, EventBus, MemoryDlqHandler) {
        let bus = EventBus::new(MemoryProvider::default());
        let dlq = MemoryDlqHandler::default();
        let worker = Arc::new(Worker::new(
            Arc::new(handler),
            bus.clone(),
            Arc::new(dlq.clone()),
            config,
        ));
        (worker, bus, dlq)
    }

    async fn next(bus: &EventBus, worker: &Worker<Flaky>) -> PendingEvent {
        let mut sub = bus
            .subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        sub.next_manual_ack().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_retries_then_acks() {
        let (worker, bus, dlq) = worker(Flaky::new(2), WorkerConfig::default());
        let shutdown = CancellationToken::new();
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        bus.publish_typed("test", &delivery()).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.process(next(&bus, &worker).await, &shutdown).await);
        }
        assert_eq!(outcomes, vec![Outcome::Retried, Outcome::Retried, Outcome::Acked]);
        assert_eq!(dlq.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letters_after_max_deliver() {
        let config = WorkerConfig {
            max_deliver: 3,
            ..Default::default()
        };
        let (worker, bus, dlq) = worker(Flaky::new(usize::MAX), config);
        let shutdown = CancellationToken::new();
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        bus.publish_typed("test", &delivery()).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.process(next(&bus, &worker).await, &shutdown).await);
        }
        assert_eq!(
            outcomes,
            vec![Outcome::Retried, Outcome::Retried, Outcome::DeadLettered]
        );
        let dead = dlq.list(1).await.unwrap();
        assert_eq!(dead[0].consumer, "flaky");
        assert!(dead[0].reason.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_malformed_input_is_not_retried() {
        let mut handler = Flaky::new(1);
        handler.error = || RelayError::InvalidPayload("bad".into());
        let (worker, bus, dlq) = worker(handler, WorkerConfig::default());
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        bus.publish_typed("test", &delivery()).await.unwrap();

        let outcome = worker
            .process(next(&bus, &worker).await, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_dead_lettered() {
        let (worker, bus, dlq) = worker(Flaky::new(0), WorkerConfig::default());
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        let bogus = Event::typed(
            bus.subject_for(MessageDelivery::TOPIC),
            "conversation",
            MessageDelivery::TOPIC,
            1,
            "bogus",
            "test",
            serde_json::json!({"messageId": 7}),
        );
        bus.publish_event(&bogus).await.unwrap();

        let outcome = worker
            .process(next(&bus, &worker).await, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(worker.handler().calls.load(Ordering::SeqCst), 0);
        assert!(dlq.list(1).await.unwrap()[0].reason.starts_with("undecodable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_cancels_and_retries() {
        let mut handler = Flaky::new(0);
        handler.sleep = Duration::from_secs(600);
        let config = WorkerConfig {
            handler_timeout_secs: 5,
            ..Default::default()
        };
        let (worker, bus, _) = worker(handler, config);
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        bus.publish_typed("test", &delivery()).await.unwrap();

        let outcome = worker
            .process(next(&bus, &worker).await, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Retried);
        assert!(worker.handler().saw_cancel.load(Ordering::SeqCst));
        let again = next(&bus, &worker).await;
        assert_eq!(again.received.num_delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_ignoring_cancel_times_out_after_grace() {
        let mut handler = Flaky::new(0);
        handler.sleep = Duration::from_secs(600);
        handler.ignore_cancel = true;
        let config = WorkerConfig {
            handler_timeout_secs: 5,
            cancel_grace_secs: 2,
            ..Default::default()
        };
        let (worker, bus, dlq) = worker(handler, config);
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        bus.publish_typed("test", &delivery()).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = worker
            .process(next(&bus, &worker).await, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Retried);
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(600));
        assert_eq!(dlq.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_loops_share_the_queue_and_stop() {
        let config = WorkerConfig {
            concurrency: 3,
            ..Default::default()
        };
        let (worker, bus, _) = worker(Flaky::new(0), config);
        let shutdown = CancellationToken::new();
        bus.subscribe_durable("flaky", MessageDelivery::TOPIC, &worker.subscribe_options())
            .await
            .unwrap();
        let handles = Arc::clone(&worker).spawn(shutdown.clone());

        for _ in 0..10 {
            bus.publish_typed("test", &delivery()).await.unwrap();
        }
        for _ in 0..100 {
            if worker.handler().calls.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.handler().calls.load(Ordering::SeqCst), 10);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

//! In-memory event provider for tests and single-process deployments
//!
//! Mirrors the JetStream semantics the pipeline relies on: durable
//! consumers are work queues shared by every subscription with the same
//! name, events published while no subscription is attached stay queued,
//! a nak puts the event back with its delivery count incremented, and a
//! repeated publish message id is acknowledged without storing the event.

use crate::error::{RelayError, Result};
use crate::provider::{EventProvider, PendingEvent, ProviderInfo, Subscription};
use crate::types::{Event, PublishOptions, ReceivedEvent};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Subject prefix (default: "events")
    pub subject_prefix: String,

    /// Maximum events retained for `history` (0 = unlimited)
    pub max_events: usize,

    /// Delay before a nak'd event is queued again
    pub redelivery_delay: Duration,

    /// Number of recent publish message ids remembered for deduplication
    pub dedup_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "events".to_string(),
            max_events: 100_000,
            redelivery_delay: Duration::ZERO,
            dedup_window: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    event: Event,
    sequence: u64,
    num_delivered: u64,
}

impl Delivery {
    fn to_received(&self, stream: &str) -> ReceivedEvent {
        ReceivedEvent {
            event: self.event.clone(),
            sequence: self.sequence,
            num_delivered: self.num_delivered,
            stream: stream.to_string(),
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>;

struct DurableQueue {
    filter: String,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: SharedReceiver,
}

struct EphemeralQueue {
    filter: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct MemoryState {
    events: VecDeque<Event>,
    next_sequence: u64,
    durable: HashMap<String, DurableQueue>,
    ephemeral: Vec<EphemeralQueue>,
    recent_ids: VecDeque<String>,
    seen_ids: HashMap<String, u64>,
}

/// In-memory event provider
#[derive(Clone)]
pub struct MemoryProvider {
    config: MemoryConfig,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryProvider {
    /// Create a provider with the given configuration
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| RelayError::Backend(format!("Memory provider lock poisoned: {}", e)))
    }

    fn stream_name(&self) -> String {
        format!("{}-memory", self.config.subject_prefix)
    }

    fn subscription(&self, rx: SharedReceiver, tx: &mpsc::UnboundedSender<Delivery>) -> MemorySubscription {
        MemorySubscription {
            rx,
            redeliver: tx.downgrade(),
            stream: self.stream_name(),
            redelivery_delay: self.config.redelivery_delay,
        }
    }
}

#[async_trait]
impl EventProvider for MemoryProvider {
    async fn publish(&self, event: &Event) -> Result<u64> {
        self.publish_with_options(event, &PublishOptions::default())
            .await
    }

    async fn publish_with_options(&self, event: &Event, opts: &PublishOptions) -> Result<u64> {
        let mut state = self.lock()?;

        if let Some(ref msg_id) = opts.msg_id {
            if let Some(&sequence) = state.seen_ids.get(msg_id) {
                tracing::debug!(
                    event_id = %event.id,
                    msg_id = %msg_id,
                    sequence,
                    "Duplicate publish suppressed"
                );
                return Ok(sequence);
            }
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;

        if let Some(ref msg_id) = opts.msg_id {
            if self.config.dedup_window > 0 {
                state.seen_ids.insert(msg_id.clone(), sequence);
                state.recent_ids.push_back(msg_id.clone());
                if state.recent_ids.len() > self.config.dedup_window {
                    if let Some(expired) = state.recent_ids.pop_front() {
                        state.seen_ids.remove(&expired);
                    }
                }
            }
        }

        state.events.push_back(event.clone());
        if self.config.max_events > 0 && state.events.len() > self.config.max_events {
            state.events.pop_front();
        }

        let delivery = Delivery {
            event: event.clone(),
            sequence,
            num_delivered: 1,
        };

        for queue in state.durable.values() {
            if subject_matches(&queue.filter, &event.subject) {
                let _ = queue.tx.send(delivery.clone());
            }
        }

        // Dropped ephemeral subscriptions are pruned on the first failed send
        state.ephemeral.retain(|queue| {
            !subject_matches(&queue.filter, &event.subject)
                || queue.tx.send(delivery.clone()).is_ok()
        });

        tracing::debug!(
            event_id = %event.id,
            subject = %event.subject,
            sequence,
            "Event published"
        );
        Ok(sequence)
    }

    async fn subscribe_durable(
        &self,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<Box<dyn Subscription>> {
        let mut state = self.lock()?;
        let queue = state
            .durable
            .entry(consumer_name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                DurableQueue {
                    filter: filter_subject.to_string(),
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                }
            });

        if queue.filter != filter_subject {
            return Err(RelayError::Consumer(format!(
                "Consumer '{}' already exists with filter '{}'",
                consumer_name, queue.filter
            )));
        }

        let sub = self.subscription(queue.rx.clone(), &queue.tx);
        tracing::info!(consumer = consumer_name, filter = filter_subject, "Durable subscription created");
        Ok(Box::new(sub))
    }

    async fn subscribe(&self, filter_subject: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscription(Arc::new(tokio::sync::Mutex::new(rx)), &tx);
        self.lock()?.ephemeral.push(EphemeralQueue {
            filter: filter_subject.to_string(),
            tx,
        });
        Ok(Box::new(sub))
    }

    async fn history(&self, filter_subject: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let state = self.lock()?;
        let matching: Vec<Event> = state
            .events
            .iter()
            .filter(|e| filter_subject.map_or(true, |f| subject_matches(f, &e.subject)))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn unsubscribe(&self, consumer_name: &str) -> Result<()> {
        if self.lock()?.durable.remove(consumer_name).is_none() {
            return Err(RelayError::Consumer(format!(
                "Consumer '{}' does not exist",
                consumer_name
            )));
        }
        tracing::info!(consumer = consumer_name, "Consumer deleted");
        Ok(())
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let state = self.lock()?;
        Ok(ProviderInfo {
            provider: "memory".to_string(),
            messages: state.events.len() as u64,
            bytes: state
                .events
                .iter()
                .map(|e| e.payload.to_string().len() as u64)
                .sum(),
            consumers: state.durable.len() + state.ephemeral.len(),
        })
    }

    fn build_subject(&self, category: &str, topic: &str) -> String {
        format!("{}.{}.{}", self.config.subject_prefix, category, topic)
    }

    fn category_subject(&self, category: &str) -> String {
        format!("{}.{}.>", self.config.subject_prefix, category)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handle returned by [`MemoryProvider`]
pub struct MemorySubscription {
    rx: SharedReceiver,
    redeliver: mpsc::WeakUnboundedSender<Delivery>,
    stream: String,
    redelivery_delay: Duration,
}

impl MemorySubscription {
    async fn recv(&self) -> Option<Delivery> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<ReceivedEvent>> {
        Ok(self.recv().await.map(|d| d.to_received(&self.stream)))
    }

    async fn next_manual_ack(&mut self) -> Result<Option<PendingEvent>> {
        let Some(delivery) = self.recv().await else {
            return Ok(None);
        };

        let received = delivery.to_received(&self.stream);
        let retry = Delivery {
            num_delivered: delivery.num_delivered + 1,
            ..delivery
        };
        let redeliver = self.redeliver.clone();
        let delay = self.redelivery_delay;

        Ok(Some(PendingEvent::new(
            received,
            || async { Ok::<(), RelayError>(()) }.boxed(),
            move || {
                async move {
                    let tx = redeliver
                        .upgrade()
                        .ok_or_else(|| RelayError::Ack("consumer no longer exists".to_string()))?;
                    if delay.is_zero() {
                        tx.send(retry)
                            .map_err(|_| RelayError::Ack("consumer queue closed".to_string()))?;
                    } else {
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(retry);
                        });
                    }
                    Ok::<(), RelayError>(())
                }
                .boxed()
            },
        )))
    }
}

/// NATS-style subject matching: `*` matches one token, `>` the remainder
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(subject: &str) -> Event {
        Event::new(subject, "conversation", "test", "test", serde_json::json!({}))
    }

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("events.conversation.>", "events.conversation.message.created"));
        assert!(subject_matches("events.*.ai.response", "events.conversation.ai.response"));
        assert!(subject_matches("events.a.b", "events.a.b"));
        assert!(!subject_matches("events.conversation.>", "events.conversation"));
        assert!(!subject_matches("events.a.b", "events.a.b.c"));
        assert!(!subject_matches("events.*", "events.a.b"));
    }

    #[tokio::test]
    async fn test_durable_queue_keeps_events_published_before_attach() {
        let provider = MemoryProvider::default();
        let subject = provider.build_subject("conversation", "message.created");
        let mut sub = provider.subscribe_durable("responder", &subject).await.unwrap();
        drop(sub);

        provider.publish(&event(&subject)).await.unwrap();

        sub = provider.subscribe_durable("responder", &subject).await.unwrap();
        let received = sub.next().await.unwrap().unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(received.num_delivered, 1);
    }

    #[tokio::test]
    async fn test_shared_durable_consumer_delivers_once() {
        let provider = MemoryProvider::default();
        let subject = "events.conversation.message.delivery";
        let mut a = provider.subscribe_durable("delivery", subject).await.unwrap();
        let mut b = provider.subscribe_durable("delivery", subject).await.unwrap();

        provider.publish(&event(subject)).await.unwrap();
        let first = a.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);

        let second = tokio::time::timeout(Duration::from_millis(50), b.next()).await;
        assert!(second.is_err(), "event must reach only one subscription");
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_incremented_count() {
        let provider = MemoryProvider::default();
        let subject = "events.conversation.ai.response";
        let mut sub = provider.subscribe_durable("reply", subject).await.unwrap();
        provider.publish(&event(subject)).await.unwrap();

        let pending = sub.next_manual_ack().await.unwrap().unwrap();
        assert_eq!(pending.received.num_delivered, 1);
        pending.nak().await.unwrap();

        let again = sub.next_manual_ack().await.unwrap().unwrap();
        assert_eq!(again.received.num_delivered, 2);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_subscription_filters_and_prunes() {
        let provider = MemoryProvider::default();
        let mut sub = provider.subscribe("events.conversation.>").await.unwrap();

        provider.publish(&event("events.system.deploy")).await.unwrap();
        provider.publish(&event("events.conversation.webhook.received")).await.unwrap();

        let received = sub.next().await.unwrap().unwrap();
        assert_eq!(received.event.subject, "events.conversation.webhook.received");

        drop(sub);
        provider.publish(&event("events.conversation.x")).await.unwrap();
        assert_eq!(provider.info().await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_history_limit_and_filter() {
        let provider = MemoryProvider::new(MemoryConfig {
            max_events: 3,
            ..Default::default()
        });
        for i in 0..5 {
            provider
                .publish(&event(&format!("events.conversation.t{}", i)))
                .await
                .unwrap();
        }

        let all = provider.history(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].subject, "events.conversation.t4");

        let last = provider.history(Some("events.conversation.>"), 1).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].subject, "events.conversation.t4");
    }

    #[tokio::test]
    async fn test_durable_filter_conflict() {
        let provider = MemoryProvider::default();
        provider.subscribe_durable("c", "events.a").await.unwrap();
        assert!(provider.subscribe_durable("c", "events.b").await.is_err());
        provider.unsubscribe("c").await.unwrap();
        assert!(provider.unsubscribe("c").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_msg_id_is_suppressed() {
        let provider = MemoryProvider::default();
        let mut sub = provider
            .subscribe_durable("normalizer", "events.conversation.>")
            .await
            .unwrap();

        let opts = PublishOptions::dedup("message.created:m-1");
        let first = provider
            .publish_with_options(&event("events.conversation.message.created"), &opts)
            .await
            .unwrap();
        let second = provider
            .publish_with_options(&event("events.conversation.message.created"), &opts)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.history(None, 10).await.unwrap().len(), 1);

        provider
            .publish(&event("events.conversation.marker"))
            .await
            .unwrap();
        sub.next().await.unwrap().unwrap();
        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.event.subject, "events.conversation.marker");
    }
}

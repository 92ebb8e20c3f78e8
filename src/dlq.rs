//! Dead letter queue: park events that exceed max delivery attempts
//!
//! Providers handle redelivery natively; deciding that an event is hopeless
//! and recording it happens here, above the provider layer.

use crate::error::Result;
use crate::types::{now_millis, ReceivedEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed event with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    /// The original received event
    pub event: ReceivedEvent,

    /// Consumer that gave up on the event
    pub consumer: String,

    /// Reason the event was sent to DLQ
    pub reason: String,

    /// Unix timestamp in milliseconds when the event was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetterEvent {
    /// Create a new dead letter event
    pub fn new(event: ReceivedEvent, consumer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event,
            consumer: consumer.into(),
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter queue handlers
///
/// Called when an event exceeds max delivery attempts or its payload can
/// never be decoded. Implementations may log, store, forward, or alert.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered event
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// Number of events currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// Most recent dead-lettered events, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// In-memory DLQ handler for development and testing
///
/// Keeps at most `max_events` entries, dropping the oldest.
#[derive(Clone)]
pub struct MemoryDlqHandler {
    events: Arc<RwLock<Vec<DeadLetterEvent>>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::warn!(
            event_id = %event.event.event.id,
            subject = %event.event.event.subject,
            consumer = %event.consumer,
            num_delivered = event.event.num_delivered,
            reason = %event.reason,
            "Event dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether a received event has used up its delivery attempts
///
/// `max_deliver = 0` means unlimited.
pub fn should_dead_letter(event: &ReceivedEvent, max_deliver: u64) -> bool {
    max_deliver > 0 && event.num_delivered >= max_deliver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Event;

    fn received(num_delivered: u64) -> ReceivedEvent {
        ReceivedEvent {
            event: Event::new(
                "events.conversation.message.created",
                "conversation",
                "inbound text",
                "normalizer",
                serde_json::json!({}),
            ),
            sequence: 1,
            num_delivered,
            stream: "memory".to_string(),
        }
    }

    #[test]
    fn test_should_dead_letter() {
        assert!(!should_dead_letter(&received(1), 5));
        assert!(!should_dead_letter(&received(4), 5));
        assert!(should_dead_letter(&received(5), 5));
        assert!(should_dead_letter(&received(10), 5));
        assert!(!should_dead_letter(&received(100), 0));
    }

    #[test]
    fn test_dead_letter_event_creation() {
        let event = received(5);
        let dle = DeadLetterEvent::new(event.clone(), "responder", "Max retries exceeded");
        assert_eq!(dle.reason, "Max retries exceeded");
        assert_eq!(dle.consumer, "responder");
        assert_eq!(dle.event.event.id, event.event.id);
        assert!(dle.dead_lettered_at > 0);
    }

    #[tokio::test]
    async fn test_memory_dlq_list_newest_first() {
        let dlq = MemoryDlqHandler::default();
        assert_eq!(dlq.count().await.unwrap(), 0);

        for i in 0..5 {
            let mut event = received(3);
            event.sequence = i;
            dlq.handle(DeadLetterEvent::new(event, "delivery", format!("reason {}", i)))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 5);
        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn test_memory_dlq_max_capacity() {
        let dlq = MemoryDlqHandler::new(3);
        for i in 0..5 {
            dlq.handle(DeadLetterEvent::new(received(1), "normalizer", format!("reason {}", i)))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }
}

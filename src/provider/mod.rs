//! Bus provider trait
//!
//! Every backend (in-memory, NATS JetStream) implements `EventProvider`
//! so pipeline stages never depend on a concrete broker. Delivery is
//! at-least-once: a handler that naks (or never acks) sees the event again.

use crate::error::Result;
use crate::types::{Event, PublishOptions, ReceivedEvent, SubscribeOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod memory;
pub mod nats;

/// Core trait for bus backends
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Publish an event, returning the provider-assigned sequence number
    async fn publish(&self, event: &Event) -> Result<u64>;

    /// Create a durable subscription
    ///
    /// Subscriptions sharing a consumer name form a work queue: each event
    /// reaches exactly one of them.
    async fn subscribe_durable(
        &self,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<Box<dyn Subscription>>;

    /// Create an ephemeral subscription (cleaned up on drop/disconnect)
    async fn subscribe(&self, filter_subject: &str) -> Result<Box<dyn Subscription>>;

    /// Fetch historical events from the backend
    async fn history(&self, filter_subject: Option<&str>, limit: usize) -> Result<Vec<Event>>;

    /// Delete a durable subscription by consumer name
    async fn unsubscribe(&self, consumer_name: &str) -> Result<()>;

    /// Get provider info (message count, etc.)
    async fn info(&self) -> Result<ProviderInfo>;

    /// Build a full subject from category and topic
    fn build_subject(&self, category: &str, topic: &str) -> String;

    /// Build a wildcard subject for a category
    fn category_subject(&self, category: &str) -> String;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Publish with provider-specific options
    ///
    /// Default implementation ignores options.
    async fn publish_with_options(&self, event: &Event, _opts: &PublishOptions) -> Result<u64> {
        self.publish(event).await
    }

    /// Create a durable subscription with provider-specific options
    ///
    /// Default implementation ignores options.
    async fn subscribe_durable_with_options(
        &self,
        consumer_name: &str,
        filter_subject: &str,
        _opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        self.subscribe_durable(consumer_name, filter_subject).await
    }
}

/// Async subscription handle for receiving events
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next event (auto-ack)
    async fn next(&mut self) -> Result<Option<ReceivedEvent>>;

    /// Receive the next event with manual ack control
    async fn next_manual_ack(&mut self) -> Result<Option<PendingEvent>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// An event pending acknowledgement
pub struct PendingEvent {
    /// The received event
    pub received: ReceivedEvent,

    ack_fn: AckFn,
    nak_fn: AckFn,
}

impl PendingEvent {
    /// Create a new pending event with ack/nak callbacks
    pub fn new(
        received: ReceivedEvent,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            received,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge (request redelivery)
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}

/// Provider status information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Provider name
    pub provider: String,
    /// Total messages stored
    pub messages: u64,
    /// Total bytes used
    pub bytes: u64,
    /// Number of active consumers/subscribers
    pub consumers: usize,
}

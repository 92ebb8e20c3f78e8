//! High-level event bus built on pluggable providers
//!
//! `EventBus` is the only handle pipeline stages hold: it builds subjects,
//! validates typed payloads against the schema registry, and publishes with
//! deterministic deduplication ids.

use crate::error::Result;
use crate::events::{PipelineEvent, CATEGORY};
use crate::provider::{EventProvider, ProviderInfo, Subscription};
use crate::schema::SchemaRegistry;
use crate::types::{Event, PublishOptions, SubscribeOptions};
use std::sync::Arc;

/// High-level event bus backed by a pluggable provider
#[derive(Clone)]
pub struct EventBus {
    provider: Arc<dyn EventProvider>,
    schemas: Option<Arc<dyn SchemaRegistry>>,
}

impl EventBus {
    /// Create a new event bus from a provider
    pub fn new(provider: impl EventProvider + 'static) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Create a bus sharing an existing provider
    pub fn from_arc(provider: Arc<dyn EventProvider>) -> Self {
        Self {
            provider,
            schemas: None,
        }
    }

    /// Validate typed events against a schema registry before publishing
    pub fn with_schema_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = Some(registry);
        self
    }

    /// Get the provider name
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Full subject of a pipeline topic
    pub fn subject_for(&self, topic: &str) -> String {
        self.provider.build_subject(CATEGORY, topic)
    }

    /// Publish a pre-built event
    pub async fn publish_event(&self, event: &Event) -> Result<u64> {
        self.publish_event_with_options(event, &PublishOptions::default())
            .await
    }

    /// Publish a pre-built event with provider-specific options
    pub async fn publish_event_with_options(
        &self,
        event: &Event,
        opts: &PublishOptions,
    ) -> Result<u64> {
        if let Some(ref schemas) = self.schemas {
            schemas.validate(event)?;
        }
        self.provider.publish_with_options(event, opts).await
    }

    /// Wrap a pipeline payload in an envelope and publish it
    pub async fn publish_typed<E: PipelineEvent>(&self, source: &str, payload: &E) -> Result<Event> {
        let mut event = Event::typed(
            self.subject_for(E::TOPIC),
            CATEGORY,
            E::TOPIC,
            E::VERSION,
            payload.summary(),
            source,
            serde_json::to_value(payload)?,
        );
        for (key, value) in payload.correlation() {
            event = event.with_metadata(key, value);
        }

        let sequence = self
            .publish_event_with_options(&event, &PublishOptions::dedup(payload.dedup_key()))
            .await?;

        tracing::debug!(
            event_id = %payload.event_id(),
            subject = %event.subject,
            sequence,
            "Pipeline event published"
        );
        Ok(event)
    }

    /// Durable work-queue subscription for a pipeline topic
    pub async fn subscribe_durable(
        &self,
        consumer_name: &str,
        topic: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let subject = self.subject_for(topic);
        self.provider
            .subscribe_durable_with_options(consumer_name, &subject, opts)
            .await
    }

    /// Ephemeral subscription to every pipeline subject
    pub async fn subscribe_all(&self) -> Result<Box<dyn Subscription>> {
        let subject = self.provider.category_subject(CATEGORY);
        self.provider.subscribe(&subject).await
    }

    /// Fetch recent pipeline events, optionally for one topic
    pub async fn list_events(&self, topic: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let filter = match topic {
            Some(topic) => self.subject_for(topic),
            None => self.provider.category_subject(CATEGORY),
        };
        self.provider.history(Some(&filter), limit).await
    }

    /// Delete a durable consumer
    pub async fn remove_consumer(&self, consumer_name: &str) -> Result<()> {
        self.provider.unsubscribe(consumer_name).await
    }

    /// Get provider info
    pub async fn info(&self) -> Result<ProviderInfo> {
        self.provider.info().await
    }

    /// Get a reference to the underlying provider
    pub fn provider(&self) -> &dyn EventProvider {
        self.provider.as_ref()
    }
}

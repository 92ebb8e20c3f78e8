//! NATS JetStream client: connect, publish, subscribe, query

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{RelayError, Result};
use crate::types::{DeliverPolicy, Event, PublishOptions, SubscribeOptions};
use async_nats::jetstream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Owns the connection and the single stream that carries every
/// pipeline subject.
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,

    /// Stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and make sure the stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = build_connect_options(&config)
            .connect(&config.url)
            .await
            .map_err(|e| RelayError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish an event, returning the JetStream sequence number
    pub async fn publish(&self, event: &Event) -> Result<u64> {
        self.publish_with_options(event, &PublishOptions::default())
            .await
    }

    /// Publish with dedup id, expected sequence and ack timeout
    pub async fn publish_with_options(&self, event: &Event, opts: &PublishOptions) -> Result<u64> {
        let payload = serde_json::to_vec(event)?;
        let publish_error = |reason: String| RelayError::Publish {
            subject: event.subject.clone(),
            reason,
        };

        let mut headers = async_nats::HeaderMap::new();
        if let Some(ref msg_id) = opts.msg_id {
            headers.insert("Nats-Msg-Id", msg_id.as_str());
        }
        if let Some(seq) = opts.expected_sequence {
            headers.insert("Nats-Expected-Last-Sequence", seq.to_string().as_str());
        }

        let ack_fut = if headers.is_empty() {
            self.jetstream
                .publish(event.subject.clone(), payload.into())
                .await
        } else {
            self.jetstream
                .publish_with_headers(event.subject.clone(), headers, payload.into())
                .await
        }
        .map_err(|e| publish_error(e.to_string()))?;

        let timeout = Duration::from_secs(opts.timeout_secs.unwrap_or(self.config.request_timeout_secs));
        let ack = tokio::time::timeout(timeout, ack_fut)
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "Publish ack timed out after {:?} for subject '{}'",
                    timeout, event.subject
                ))
            })?
            .map_err(|e| publish_error(format!("ack failed: {}", e)))?;

        tracing::debug!(
            event_id = %event.id,
            subject = %event.subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Event published"
        );

        Ok(ack.sequence)
    }

    /// Create (or attach to) a durable pull consumer
    pub async fn subscribe_durable(
        &self,
        consumer_name: &str,
        filter_subject: &str,
        opts: &SubscribeOptions,
    ) -> Result<NatsSubscription> {
        let config = build_consumer_config(filter_subject, Some(consumer_name), opts);

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(consumer_name, config)
            .await
            .map_err(|e| {
                RelayError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| RelayError::Subscribe {
                subject: filter_subject.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            consumer = consumer_name,
            filter = filter_subject,
            max_deliver = ?opts.max_deliver,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(messages, self.config.stream_name.clone()))
    }

    /// Create an ephemeral pull consumer
    pub async fn subscribe(&self, filter_subject: &str) -> Result<NatsSubscription> {
        let config = build_consumer_config(filter_subject, None, &SubscribeOptions::default());

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| RelayError::Consumer(format!("Failed to create ephemeral consumer: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| RelayError::Subscribe {
                subject: filter_subject.to_string(),
                reason: e.to_string(),
            })?;

        Ok(NatsSubscription::new(messages, self.config.stream_name.clone()))
    }

    /// Fetch recent events from the stream
    pub async fn history(&self, filter_subject: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let mut config = jetstream::consumer::pull::Config {
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ack_policy: jetstream::consumer::AckPolicy::None,
            ..Default::default()
        };
        if let Some(subject) = filter_subject {
            config.filter_subject = subject.to_string();
        }

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| RelayError::Consumer(format!("Failed to create history consumer: {}", e)))?;

        let batch = consumer
            .fetch()
            .max_messages(limit)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| RelayError::Backend(format!("Failed to fetch history: {}", e)))?;

        let mut events = Vec::with_capacity(limit);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    if let Ok(event) = serde_json::from_slice::<Event>(&msg.payload) {
                        events.push(event);
                    }
                    if events.len() >= limit {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error fetching history message");
                    break;
                }
            }
        }

        Ok(events)
    }

    /// Delete a durable consumer
    pub async fn unsubscribe(&self, consumer_name: &str) -> Result<()> {
        self.stream
            .lock()
            .await
            .delete_consumer(consumer_name)
            .await
            .map_err(|e| {
                RelayError::Consumer(format!("Failed to delete consumer '{}': {}", consumer_name, e))
            })?;

        tracing::info!(consumer = consumer_name, "Consumer deleted");
        Ok(())
    }

    /// Current stream counters
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| RelayError::Stream(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Underlying NATS connection
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Provider configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub consumer_count: usize,
}

fn build_consumer_config(
    filter_subject: &str,
    durable_name: Option<&str>,
    opts: &SubscribeOptions,
) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &opts.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            let start_time = time::OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(*timestamp) * 1_000_000,
            )
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time }
        }
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    };

    jetstream::consumer::pull::Config {
        durable_name: durable_name.map(str::to_string),
        filter_subject: filter_subject.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        max_deliver: opts.max_deliver.unwrap_or(0),
        max_ack_pending: opts.max_ack_pending.unwrap_or(0),
        ack_wait: opts.ack_wait_secs.map(Duration::from_secs).unwrap_or_default(),
        backoff: opts.backoff_secs.iter().copied().map(Duration::from_secs).collect(),
        ..Default::default()
    }
}

fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        RelayError::Stream(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_maps_options() {
        let opts = SubscribeOptions {
            max_deliver: Some(5),
            backoff_secs: vec![1, 5, 30],
            max_ack_pending: Some(64),
            deliver_policy: DeliverPolicy::New,
            ack_wait_secs: Some(60),
        };
        let config = build_consumer_config("events.conversation.>", Some("responder"), &opts);

        assert_eq!(config.durable_name.as_deref(), Some("responder"));
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.max_ack_pending, 64);
        assert_eq!(config.ack_wait, Duration::from_secs(60));
        assert_eq!(config.backoff.len(), 3);
        assert!(matches!(
            config.deliver_policy,
            jetstream::consumer::DeliverPolicy::New
        ));
    }

    #[test]
    fn test_consumer_config_start_time() {
        let opts = SubscribeOptions {
            deliver_policy: DeliverPolicy::ByStartTime {
                timestamp: 1_700_000_000_123,
            },
            ..Default::default()
        };
        let config = build_consumer_config("events.>", None, &opts);
        match config.deliver_policy {
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time } => {
                assert_eq!(start_time.unix_timestamp(), 1_700_000_000);
                assert_eq!(start_time.millisecond(), 123);
            }
            other => panic!("unexpected policy: {:?}", other),
        }
    }
}

//! Bus envelope and delivery option types
//!
//! All types use camelCase JSON serialization for wire compatibility.
//! Pipeline payloads (see [`crate::events`]) travel inside [`Event`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single envelope on the bus
///
/// Events are published to subjects following the dot-separated convention:
/// `<prefix>.<category>.<topic>` (e.g., `events.conversation.message.created`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique envelope identifier (evt-<uuid>)
    pub id: String,

    /// Subject this event was published to
    pub subject: String,

    /// Top-level category for grouping (e.g., "conversation")
    pub category: String,

    /// Event type identifier (e.g., "message.created")
    ///
    /// Used by the schema registry to look up the minimum field set.
    #[serde(default)]
    pub event_type: String,

    /// Schema version for this event type
    #[serde(default = "default_version")]
    pub version: u32,

    /// Event payload
    pub payload: serde_json::Value,

    /// Human-readable summary
    pub summary: String,

    /// Stage that produced this event
    pub source: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Correlation metadata (organization, conversation, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl Event {
    /// Create an untyped event with auto-generated id and timestamp
    pub fn new(
        subject: impl Into<String>,
        category: impl Into<String>,
        summary: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::typed(subject, category, "", 1, summary, source, payload)
    }

    /// Create a typed event with explicit event_type and version
    pub fn typed(
        subject: impl Into<String>,
        category: impl Into<String>,
        event_type: impl Into<String>,
        version: u32,
        summary: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            subject: subject.into(),
            category: category.into(),
            event_type: event_type.into(),
            version,
            payload,
            summary: summary.into(),
            source: source.into(),
            timestamp: now_millis(),
            metadata: HashMap::new(),
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A received event with delivery context
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// The event data
    pub event: Event,

    /// Provider-assigned sequence number
    pub sequence: u64,

    /// Number of delivery attempts, starting at 1
    pub num_delivered: u64,

    /// Stream/topic name
    pub stream: String,
}

/// Delivery policy for subscriptions
///
/// Controls where a new consumer starts reading from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliverPolicy {
    /// Deliver all available messages
    #[default]
    All,
    /// Deliver starting from the last message
    Last,
    /// Deliver only new messages published after subscription
    New,
    /// Deliver starting from a specific sequence number
    ByStartSequence { sequence: u64 },
    /// Deliver starting from a specific timestamp (Unix milliseconds)
    ByStartTime { timestamp: u64 },
    /// Deliver the last message per subject
    LastPerSubject,
}

/// Options for publishing events
///
/// Unsupported options are ignored by providers that don't support them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    /// Deduplication message ID (NATS: `Nats-Msg-Id` header)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,

    /// Expected last sequence number (optimistic concurrency)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sequence: Option<u64>,

    /// Publish timeout in seconds (overrides provider default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PublishOptions {
    /// Options carrying only a deduplication id
    pub fn dedup(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: Some(msg_id.into()),
            ..Default::default()
        }
    }
}

/// Options for creating subscriptions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    /// Maximum delivery attempts (NATS: `MaxDeliver`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,

    /// Backoff intervals in seconds between redelivery attempts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff_secs: Vec<u64>,

    /// Maximum number of unacknowledged messages in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,

    /// Where to start consuming from
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    /// How long to wait for an ack before redelivery (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_secs: Option<u64>,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            "events.conversation.webhook.received",
            "conversation",
            "2 messages from whatsapp",
            "ingest",
            serde_json::json!({"platform": "whatsapp"}),
        );

        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.category, "conversation");
        assert_eq!(event.event_type, "");
        assert_eq!(event.version, 1);
        assert!(event.timestamp > 0);
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_typed_event_with_metadata() {
        let event = Event::typed(
            "events.conversation.message.created",
            "conversation",
            "message.created",
            2,
            "inbound text",
            "normalizer",
            serde_json::json!({}),
        )
        .with_metadata("organizationId", "org-1")
        .with_metadata("conversationId", "conv-9");

        assert_eq!(event.event_type, "message.created");
        assert_eq!(event.version, 2);
        assert_eq!(event.metadata["conversationId"], "conv-9");
    }

    #[test]
    fn test_event_wire_format_is_camel_case() {
        let event = Event::typed(
            "events.conversation.ai.response",
            "conversation",
            "ai.response",
            1,
            "reply",
            "responder",
            serde_json::json!({"response": "hi"}),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"ai.response\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.payload["response"], "hi");
    }

    #[test]
    fn test_event_missing_type_defaults() {
        let json = r#"{
            "id": "evt-123",
            "subject": "events.conversation.x",
            "category": "conversation",
            "payload": {},
            "summary": "s",
            "source": "t",
            "timestamp": 1700000000000
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "");
        assert_eq!(event.version, 1);
    }

    #[test]
    fn test_publish_options_dedup() {
        let opts = PublishOptions::dedup("message-created:abc");
        let json = serde_json::to_string(&opts).unwrap();
        assert!(json.contains("\"msgId\":\"message-created:abc\""));
        assert!(!json.contains("expectedSequence"));
    }

    #[test]
    fn test_subscribe_options_skip_empty_fields() {
        let opts = SubscribeOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        assert!(!json.contains("maxDeliver"));
        assert!(!json.contains("backoffSecs"));
        assert_eq!(opts.deliver_policy, DeliverPolicy::All);
    }

    #[test]
    fn test_deliver_policy_by_start_sequence() {
        let policy = DeliverPolicy::ByStartSequence { sequence: 100 };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"sequence\":100"));

        let parsed: DeliverPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}

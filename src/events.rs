//! Typed pipeline events
//!
//! Each stage communicates with the next exclusively through one of these
//! payloads, carried inside the bus [`Event`] envelope under
//! `<prefix>.conversation.<topic>`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{DeliveryMedium, Direction, MessageKind, Platform, SenderType};
use crate::error::{RelayError, Result};
use crate::platform::WebhookMessage;
use crate::schema::EventSchema;
use crate::types::Event;

/// Bus category shared by every pipeline subject
pub const CATEGORY: &str = "conversation";

/// A payload that travels between pipeline stages
pub trait PipelineEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Subject topic, also used as the schema event type
    const TOPIC: &'static str;

    /// Schema version written into the envelope
    const VERSION: u32 = 1;

    /// Minimum payload fields checked by the schema registry
    const REQUIRED_FIELDS: &'static [&'static str];

    /// Unique id of this event instance
    fn event_id(&self) -> &str;

    /// Deterministic publish deduplication key
    ///
    /// Two publishes describing the same fact share a key, so a provider
    /// with a dedup window stores only the first.
    fn dedup_key(&self) -> String;

    /// Human-readable summary for the envelope
    fn summary(&self) -> String;

    /// Correlation ids copied into envelope metadata
    fn correlation(&self) -> Vec<(&'static str, String)>;

    /// Decode the payload of a bus envelope
    fn from_event(event: &Event) -> Result<Self> {
        if !event.event_type.is_empty() && event.event_type != Self::TOPIC {
            return Err(RelayError::InvalidPayload(format!(
                "expected event type '{}', got '{}'",
                Self::TOPIC,
                event.event_type
            )));
        }
        Ok(serde_json::from_value(event.payload.clone())?)
    }

    /// Schema for the registry
    fn schema() -> EventSchema {
        EventSchema::new(Self::TOPIC, Self::VERSION, Self::REQUIRED_FIELDS, Self::TOPIC)
    }
}

/// Fresh event id
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Schemas of all pipeline events
pub fn pipeline_schemas() -> Vec<EventSchema> {
    vec![
        WebhookReceived::schema(),
        MessageCreated::schema(),
        AiResponseReceived::schema(),
        MessageDelivery::schema(),
    ]
}

/// Parsed webhook batch, published by the ingestion handler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceived {
    pub event_id: String,
    pub platform: Platform,
    pub organization_id: Uuid,
    pub channel_id: i32,
    pub messages: Vec<WebhookMessage>,
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl PipelineEvent for WebhookReceived {
    const TOPIC: &'static str = "webhook.received";
    const REQUIRED_FIELDS: &'static [&'static str] = &[
        "eventId",
        "platform",
        "organizationId",
        "channelId",
        "messages",
        "rawPayload",
        "receivedAt",
    ];

    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", Self::TOPIC, self.event_id)
    }

    fn summary(&self) -> String {
        format!("{} message(s) from {}", self.messages.len(), self.platform)
    }

    fn correlation(&self) -> Vec<(&'static str, String)> {
        vec![
            ("organizationId", self.organization_id.to_string()),
            ("platform", self.platform.to_string()),
        ]
    }
}

/// A message was persisted, published by the normalization worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreated {
    pub event_id: String,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub content: String,
    pub sender_type: SenderType,
    pub direction: Direction,
    pub message_kind: MessageKind,
    /// Provider media reference until re-hosting patches the message
    pub media_url: Option<String>,
    pub channel_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageCreated {
    /// Only customer-authored inbound messages trigger a reply
    pub fn wants_reply(&self) -> bool {
        self.direction == Direction::Inbound && self.sender_type == SenderType::Contact
    }
}

impl PipelineEvent for MessageCreated {
    const TOPIC: &'static str = "message.created";
    const REQUIRED_FIELDS: &'static [&'static str] = &[
        "eventId",
        "messageId",
        "conversationId",
        "organizationId",
        "contactId",
        "content",
        "senderType",
        "direction",
        "messageKind",
        "mediaUrl",
        "channelMessageId",
        "createdAt",
    ];

    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", Self::TOPIC, self.message_id)
    }

    fn summary(&self) -> String {
        format!("{:?} {:?} message", self.direction, self.message_kind).to_lowercase()
    }

    fn correlation(&self) -> Vec<(&'static str, String)> {
        vec![
            ("organizationId", self.organization_id.to_string()),
            ("conversationId", self.conversation_id.to_string()),
            ("messageId", self.message_id.to_string()),
        ]
    }
}

/// Generated reply, published by the AI context & response worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponseReceived {
    pub event_id: String,
    /// The inbound message being answered
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub response: String,
    pub model: String,
    pub confidence_score: f32,
    pub processing_time_ms: u64,
    pub channel_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineEvent for AiResponseReceived {
    const TOPIC: &'static str = "ai.response";
    const REQUIRED_FIELDS: &'static [&'static str] = &[
        "eventId",
        "messageId",
        "conversationId",
        "organizationId",
        "contactId",
        "response",
        "model",
        "confidenceScore",
        "processingTimeMs",
        "channelMessageId",
        "createdAt",
    ];

    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", Self::TOPIC, self.message_id)
    }

    fn summary(&self) -> String {
        format!("{} reply in {}ms", self.model, self.processing_time_ms)
    }

    fn correlation(&self) -> Vec<(&'static str, String)> {
        vec![
            ("organizationId", self.organization_id.to_string()),
            ("conversationId", self.conversation_id.to_string()),
            ("messageId", self.message_id.to_string()),
        ]
    }
}

/// Request to send an outbound message, published by the reply dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivery {
    pub event_id: String,
    /// The outbound message to send
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub medium: DeliveryMedium,
    /// Provider id of the inbound message being replied to
    pub channel_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineEvent for MessageDelivery {
    const TOPIC: &'static str = "message.delivery";
    const REQUIRED_FIELDS: &'static [&'static str] = &[
        "eventId",
        "messageId",
        "conversationId",
        "organizationId",
        "contactId",
        "medium",
        "channelMessageId",
        "createdAt",
    ];

    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}", Self::TOPIC, self.message_id)
    }

    fn summary(&self) -> String {
        format!("deliver {} via {:?}", self.message_id, self.medium).to_lowercase()
    }

    fn correlation(&self) -> Vec<(&'static str, String)> {
        vec![
            ("organizationId", self.organization_id.to_string()),
            ("conversationId", self.conversation_id.to_string()),
            ("messageId", self.message_id.to_string()),
        ]
    }
}

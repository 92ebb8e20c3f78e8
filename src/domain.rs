//! Conversation domain records
//!
//! These are the durable entities owned by the persistence collaborators.
//! The pipeline only reads them and mutates them through the narrow
//! operations in [`crate::services`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RelayError;

/// Source platform of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    WhatsApp,
    Instagram,
    Facebook,
    Email,
}

impl Platform {
    /// All supported platforms
    pub const ALL: [Platform; 4] = [
        Platform::WhatsApp,
        Platform::Instagram,
        Platform::Facebook,
        Platform::Email,
    ];

    /// Stable numeric channel id
    pub fn channel_id(self) -> i32 {
        match self {
            Platform::WhatsApp => 1,
            Platform::Instagram => 2,
            Platform::Facebook => 3,
            Platform::Email => 4,
        }
    }

    /// Registry key
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Email => "email",
        }
    }

    /// Reverse of [`Platform::channel_id`]
    pub fn from_channel_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.channel_id() == id)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Platform::WhatsApp),
            "instagram" => Ok(Platform::Instagram),
            "facebook" | "messenger" => Ok(Platform::Facebook),
            "email" => Ok(Platform::Email),
            other => Err(RelayError::UnsupportedPlatform(other.to_string())),
        }
    }
}

/// Content kind of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Sticker,
    Interactive,
    Unknown,
}

impl MessageKind {
    /// Kinds whose payload is a provider media reference
    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::Video | MessageKind::Audio | MessageKind::Document
        )
    }

    /// Map a provider type tag ("image", "file", "voice", ...)
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "text" => MessageKind::Text,
            "image" | "photo" => MessageKind::Image,
            "video" | "reel" | "ig_reel" => MessageKind::Video,
            "audio" | "voice" => MessageKind::Audio,
            "document" | "file" => MessageKind::Document,
            "location" => MessageKind::Location,
            "sticker" => MessageKind::Sticker,
            "interactive" | "button" | "postback" => MessageKind::Interactive,
            _ => MessageKind::Unknown,
        }
    }
}

/// Message direction relative to the organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    /// The customer
    Contact,
    Ai,
    /// A human operator
    Agent,
    System,
}

impl SenderType {
    /// Role label used when rendering history
    pub fn role_label(self) -> &'static str {
        match self {
            SenderType::Contact => "Customer",
            SenderType::Ai => "Assistant",
            SenderType::Agent => "Agent",
            SenderType::System => "System",
        }
    }
}

/// Delivery lifecycle of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// `Pending → Sent → Delivered/Read | Failed`
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Sent, Failed)
                | (Delivered, Read)
        )
    }

    /// Whether the delivery stage has already finished with this message
    pub fn is_settled(self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Pending,
    Resolved,
    Closed,
}

impl ConversationStatus {
    /// Active conversations accept new inbound messages
    pub fn is_active(self) -> bool {
        matches!(self, ConversationStatus::Open | ConversationStatus::Pending)
    }
}

/// Conversation priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Three-way sentiment label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        })
    }
}

/// Outbound delivery medium
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMedium {
    /// The contact's chat channel (WhatsApp, Instagram, Messenger)
    #[default]
    Chat,
    Email,
    Sms,
}

/// External party of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub platform: Platform,
    /// Channel address (phone number, page-scoped id, email address)
    pub identifier: String,
    pub name: String,
    /// Free-form memory document, see [`crate::contact_memory::ContactMemory`]
    #[serde(default)]
    pub memory: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contact creation request
#[derive(Debug, Clone)]
pub struct NewContact {
    pub organization_id: Uuid,
    pub platform: Platform,
    pub identifier: String,
    pub name: String,
}

/// Thread between one contact and one organization over one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub platform: Platform,
    pub status: ConversationStatus,
    pub priority: Priority,
    pub ai_enabled: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Conversation creation request
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub platform: Platform,
    pub status: ConversationStatus,
    pub priority: Priority,
    pub ai_enabled: bool,
}

impl NewConversation {
    /// Open, low priority, AI-enabled
    pub fn open(organization_id: Uuid, contact_id: Uuid, platform: Platform) -> Self {
        Self {
            organization_id,
            contact_id,
            platform,
            status: ConversationStatus::Open,
            priority: Priority::Low,
            ai_enabled: true,
        }
    }
}

/// Stored file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub contact_id: Uuid,
    pub direction: Direction,
    pub sender_type: SenderType,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Provider-side id (inbound origin id, or the id returned by the send API)
    pub channel_message_id: Option<String>,
    /// Inbound message an outbound reply answers
    pub in_reply_to: Option<Uuid>,
    pub status: MessageStatus,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message creation request
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub contact_id: Uuid,
    pub direction: Direction,
    pub sender_type: SenderType,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub channel_message_id: Option<String>,
    pub in_reply_to: Option<Uuid>,
    pub status: MessageStatus,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Delivery status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub failure_reason: Option<String>,
    pub channel_message_id: Option<String>,
}

impl StatusUpdate {
    /// Successful send
    pub fn sent(channel_message_id: Option<String>) -> Self {
        Self {
            status: MessageStatus::Sent,
            failure_reason: None,
            channel_message_id,
        }
    }

    /// Terminal failure with a reason
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Failed,
            failure_reason: Some(reason.into()),
            channel_message_id: None,
        }
    }
}

/// Organization-level AI settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSettings {
    pub organization_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the bundled default system prompt when set
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub ai_model: Option<String>,
}

/// One knowledge-base entry used to ground replies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

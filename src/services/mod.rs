//! Collaborator interfaces
//!
//! Persistence, organization settings, outbound channels, media storage and
//! the language model live outside the pipeline. Stages reach them only
//! through these narrow traits.

pub mod memory;

use crate::domain::{
    Attachment, Contact, Conversation, KnowledgeEntry, Message, MessageKind, NewContact,
    NewConversation, NewMessage, OrganizationSettings, Platform, StatusUpdate,
};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Contact lookup/create/update
#[async_trait]
pub trait ContactService: Send + Sync {
    /// Contact with this channel address in the organization
    async fn find_by_identifier(
        &self,
        organization_id: Uuid,
        platform: Platform,
        identifier: &str,
    ) -> Result<Option<Contact>>;

    /// Fetch by id (`NotFound` if absent)
    async fn get(&self, contact_id: Uuid) -> Result<Contact>;

    /// Create; `AlreadyExists` when the channel address is taken
    async fn create(&self, contact: NewContact) -> Result<Contact>;

    /// Replace the memory document
    async fn update_memory(&self, contact_id: Uuid, memory: serde_json::Value) -> Result<()>;
}

/// Conversation lookup-active/create/update
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// The active (open or pending) conversation for the tuple
    async fn find_active(
        &self,
        organization_id: Uuid,
        contact_id: Uuid,
        platform: Platform,
    ) -> Result<Option<Conversation>>;

    async fn get(&self, conversation_id: Uuid) -> Result<Conversation>;

    /// Create; `AlreadyExists` when an active conversation exists for the tuple
    async fn create(&self, conversation: NewConversation) -> Result<Conversation>;

    /// Record activity
    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Message create/update/list
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Create; `AlreadyExists` on a duplicate origin id or a second reply
    async fn create(&self, message: NewMessage) -> Result<Message>;

    async fn get(&self, message_id: Uuid) -> Result<Message>;

    /// Message in the conversation with this provider-side id
    async fn find_by_channel_message_id(
        &self,
        conversation_id: Uuid,
        channel_message_id: &str,
    ) -> Result<Option<Message>>;

    /// Outbound reply already created for an inbound message
    async fn find_reply_to(&self, message_id: Uuid) -> Result<Option<Message>>;

    /// Patch the re-hosted media URL and attachment metadata
    async fn attach_media(
        &self,
        message_id: Uuid,
        media_url: String,
        attachment: Attachment,
    ) -> Result<()>;

    /// Apply a delivery status transition
    async fn update_status(&self, message_id: Uuid, update: StatusUpdate) -> Result<()>;

    /// Newest `limit` messages of the conversation, oldest first
    async fn list_recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    /// Total messages in the conversation
    async fn count(&self, conversation_id: Uuid) -> Result<u64>;
}

/// Organization settings and knowledge read
#[async_trait]
pub trait OrganizationService: Send + Sync {
    async fn settings(&self, organization_id: Uuid) -> Result<OrganizationSettings>;

    /// Active knowledge entries
    async fn knowledge(&self, organization_id: Uuid) -> Result<Vec<KnowledgeEntry>>;
}

/// Resolves routing keys (page ids, phone number ids, inbox addresses) to tenants
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn resolve(&self, platform: Platform, routing_key: &str) -> Result<Option<Uuid>>;
}

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTarget {
    pub organization_id: Uuid,
    pub platform: Platform,
    /// Channel address of the contact
    pub recipient: String,
    /// Provider id of the message being answered
    pub reply_to: Option<String>,
}

/// Outbound channel send
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Send text, returning the provider message id when one is reported
    async fn send_text(&self, target: &OutboundTarget, text: &str) -> Result<Option<String>>;

    /// Show a typing indicator
    async fn send_typing(&self, target: &OutboundTarget) -> Result<()>;
}

/// Downloaded media
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// Resolves a provider media reference to its content
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        organization_id: Uuid,
        platform: Platform,
        reference: &str,
    ) -> Result<FetchedMedia>;
}

/// Blob storage for re-hosted media
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store under `key`, returning the public URL
    async fn upload(&self, key: &str, media: &FetchedMedia) -> Result<String>;
}

/// Input of one generation
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub organization_id: Uuid,
    /// Assembled context
    pub context: String,
    /// The live customer message
    pub message: String,
    /// Organization model override
    pub model: Option<String>,
}

/// Output of one generation
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub confidence: f32,
}

/// Language-model text and media generation
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;

    async fn generate_with_media(
        &self,
        request: &GenerationRequest,
        media_url: &str,
        kind: MessageKind,
    ) -> Result<Generation>;
}

/// Every collaborator the workers need
#[derive(Clone)]
pub struct Services {
    pub contacts: Arc<dyn ContactService>,
    pub conversations: Arc<dyn ConversationService>,
    pub messages: Arc<dyn MessageService>,
    pub organizations: Arc<dyn OrganizationService>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub sender: Arc<dyn ChannelSender>,
    pub media: Arc<dyn MediaFetcher>,
    pub blobs: Arc<dyn BlobStore>,
    pub model: Arc<dyn LanguageModel>,
}

//! In-memory collaborators for development and testing
//!
//! `MemoryBackend` enforces the same uniqueness constraints a real store
//! would, so idempotent get-or-create paths are exercised for real.

use super::{
    BlobStore, ChannelSender, ContactService, ConversationService, FetchedMedia, Generation,
    GenerationRequest, LanguageModel, MediaFetcher, MessageService, OrganizationService,
    OutboundTarget, Services, TenantDirectory,
};
use crate::domain::{
    Attachment, Contact, Conversation, Direction, KnowledgeEntry, Message, MessageKind,
    NewContact, NewConversation, NewMessage, OrganizationSettings, Platform, StatusUpdate,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct BackendState {
    contacts: HashMap<Uuid, Contact>,
    conversations: HashMap<Uuid, Conversation>,
    /// Insertion order is creation order
    messages: Vec<Message>,
    settings: HashMap<Uuid, OrganizationSettings>,
    knowledge: HashMap<Uuid, Vec<KnowledgeEntry>>,
    routes: HashMap<(Platform, String), Uuid>,
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
}

impl BackendState {
    /// Count the call and consume an injected failure, if any
    fn enter(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = self.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RelayError::Service(format!("injected failure in {}", op)));
            }
        }
        Ok(())
    }

    fn message_mut(&mut self, id: Uuid) -> Result<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| RelayError::NotFound(format!("message {}", id)))
    }
}

/// Contacts, conversations, messages, organizations and tenant routes in memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a service error
    ///
    /// `op` is `"<service>.<method>"`, e.g. `"conversations.create"`.
    pub async fn fail_next(&self, op: &'static str, times: usize) {
        self.state.write().await.failures.insert(op, times);
    }

    /// Number of calls made to `op`
    pub async fn calls(&self, op: &'static str) -> usize {
        self.state.read().await.calls.get(op).copied().unwrap_or(0)
    }

    pub async fn set_settings(&self, settings: OrganizationSettings) {
        self.state
            .write()
            .await
            .settings
            .insert(settings.organization_id, settings);
    }

    pub async fn add_knowledge(&self, organization_id: Uuid, title: &str, content: &str) {
        self.state
            .write()
            .await
            .knowledge
            .entry(organization_id)
            .or_default()
            .push(KnowledgeEntry {
                id: Uuid::new_v4(),
                title: title.to_string(),
                content: content.to_string(),
                active: true,
            });
    }

    /// Route a platform routing key to an organization
    pub async fn add_route(&self, platform: Platform, routing_key: &str, organization_id: Uuid) {
        self.state
            .write()
            .await
            .routes
            .insert((platform, routing_key.to_string()), organization_id);
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.state.read().await.contacts.values().cloned().collect()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.values().cloned().collect()
    }

    /// All messages in creation order
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Disable AI replies on a conversation
    pub async fn set_ai_enabled(&self, conversation_id: Uuid, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| RelayError::NotFound(format!("conversation {}", conversation_id)))?;
        conversation.ai_enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl ContactService for MemoryBackend {
    async fn find_by_identifier(
        &self,
        organization_id: Uuid,
        platform: Platform,
        identifier: &str,
    ) -> Result<Option<Contact>> {
        let mut state = self.state.write().await;
        state.enter("contacts.find")?;
        Ok(state
            .contacts
            .values()
            .find(|c| {
                c.organization_id == organization_id
                    && c.platform == platform
                    && c.identifier == identifier
            })
            .cloned())
    }

    async fn get(&self, contact_id: Uuid) -> Result<Contact> {
        let mut state = self.state.write().await;
        state.enter("contacts.get")?;
        state
            .contacts
            .get(&contact_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("contact {}", contact_id)))
    }

    async fn create(&self, new: NewContact) -> Result<Contact> {
        let mut state = self.state.write().await;
        state.enter("contacts.create")?;
        let taken = state.contacts.values().any(|c| {
            c.organization_id == new.organization_id
                && c.platform == new.platform
                && c.identifier == new.identifier
        });
        if taken {
            return Err(RelayError::AlreadyExists(format!(
                "contact {} on {}",
                new.identifier, new.platform
            )));
        }

        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            platform: new.platform,
            identifier: new.identifier,
            name: new.name,
            memory: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        state.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn update_memory(&self, contact_id: Uuid, memory: serde_json::Value) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("contacts.update_memory")?;
        let contact = state
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| RelayError::NotFound(format!("contact {}", contact_id)))?;
        contact.memory = memory;
        contact.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ConversationService for MemoryBackend {
    async fn find_active(
        &self,
        organization_id: Uuid,
        contact_id: Uuid,
        platform: Platform,
    ) -> Result<Option<Conversation>> {
        let mut state = self.state.write().await;
        state.enter("conversations.find_active")?;
        Ok(state
            .conversations
            .values()
            .find(|c| {
                c.organization_id == organization_id
                    && c.contact_id == contact_id
                    && c.platform == platform
                    && c.status.is_active()
            })
            .cloned())
    }

    async fn get(&self, conversation_id: Uuid) -> Result<Conversation> {
        let mut state = self.state.write().await;
        state.enter("conversations.get")?;
        state
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn create(&self, new: NewConversation) -> Result<Conversation> {
        let mut state = self.state.write().await;
        state.enter("conversations.create")?;
        let active_exists = new.status.is_active()
            && state.conversations.values().any(|c| {
                c.organization_id == new.organization_id
                    && c.contact_id == new.contact_id
                    && c.platform == new.platform
                    && c.status.is_active()
            });
        if active_exists {
            return Err(RelayError::AlreadyExists(format!(
                "active conversation for contact {} on {}",
                new.contact_id, new.platform
            )));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            contact_id: new.contact_id,
            platform: new.platform,
            status: new.status,
            priority: new.priority,
            ai_enabled: new.ai_enabled,
            last_message_at: None,
            created_at: Utc::now(),
        };
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("conversations.touch")?;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| RelayError::NotFound(format!("conversation {}", conversation_id)))?;
        conversation.last_message_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl MessageService for MemoryBackend {
    async fn create(&self, new: NewMessage) -> Result<Message> {
        let mut state = self.state.write().await;
        state.enter("messages.create")?;

        if let Some(ref origin) = new.channel_message_id {
            let duplicate = state.messages.iter().any(|m| {
                m.conversation_id == new.conversation_id
                    && m.channel_message_id.as_deref() == Some(origin.as_str())
            });
            if duplicate {
                return Err(RelayError::AlreadyExists(format!("message {}", origin)));
            }
        }
        if let (Direction::Outbound, Some(reply_to)) = (new.direction, new.in_reply_to) {
            if state.messages.iter().any(|m| m.in_reply_to == Some(reply_to)) {
                return Err(RelayError::AlreadyExists(format!("reply to {}", reply_to)));
            }
        }

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            conversation_id: new.conversation_id,
            contact_id: new.contact_id,
            direction: new.direction,
            sender_type: new.sender_type,
            kind: new.kind,
            content: new.content,
            media_url: new.media_url,
            attachments: Vec::new(),
            channel_message_id: new.channel_message_id,
            in_reply_to: new.in_reply_to,
            status: new.status,
            failure_reason: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn get(&self, message_id: Uuid) -> Result<Message> {
        let mut state = self.state.write().await;
        state.enter("messages.get")?;
        state.message_mut(message_id).map(|m| m.clone())
    }

    async fn find_by_channel_message_id(
        &self,
        conversation_id: Uuid,
        channel_message_id: &str,
    ) -> Result<Option<Message>> {
        let mut state = self.state.write().await;
        state.enter("messages.find_by_channel_message_id")?;
        Ok(state
            .messages
            .iter()
            .find(|m| {
                m.conversation_id == conversation_id
                    && m.channel_message_id.as_deref() == Some(channel_message_id)
            })
            .cloned())
    }

    async fn find_reply_to(&self, message_id: Uuid) -> Result<Option<Message>> {
        let mut state = self.state.write().await;
        state.enter("messages.find_reply_to")?;
        Ok(state
            .messages
            .iter()
            .find(|m| m.direction == Direction::Outbound && m.in_reply_to == Some(message_id))
            .cloned())
    }

    async fn attach_media(
        &self,
        message_id: Uuid,
        media_url: String,
        attachment: Attachment,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("messages.attach_media")?;
        let message = state.message_mut(message_id)?;
        message.media_url = Some(media_url);
        message.attachments.push(attachment);
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(&self, message_id: Uuid, update: StatusUpdate) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("messages.update_status")?;
        let message = state.message_mut(message_id)?;
        if !message.status.can_transition_to(update.status) {
            return Err(RelayError::Service(format!(
                "invalid status transition {:?} -> {:?} for message {}",
                message.status, update.status, message_id
            )));
        }
        message.status = update.status;
        message.failure_reason = update.failure_reason;
        if update.channel_message_id.is_some() {
            message.channel_message_id = update.channel_message_id;
        }
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn list_recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let mut state = self.state.write().await;
        state.enter("messages.list_recent")?;
        let in_conversation: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        let skip = in_conversation.len().saturating_sub(limit);
        Ok(in_conversation.into_iter().skip(skip).cloned().collect())
    }

    async fn count(&self, conversation_id: Uuid) -> Result<u64> {
        let mut state = self.state.write().await;
        state.enter("messages.count")?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count() as u64)
    }
}

#[async_trait]
impl OrganizationService for MemoryBackend {
    async fn settings(&self, organization_id: Uuid) -> Result<OrganizationSettings> {
        let mut state = self.state.write().await;
        state.enter("organizations.settings")?;
        Ok(state
            .settings
            .get(&organization_id)
            .cloned()
            .unwrap_or_else(|| OrganizationSettings {
                organization_id,
                ..Default::default()
            }))
    }

    async fn knowledge(&self, organization_id: Uuid) -> Result<Vec<KnowledgeEntry>> {
        let mut state = self.state.write().await;
        state.enter("organizations.knowledge")?;
        Ok(state
            .knowledge
            .get(&organization_id)
            .map(|entries| entries.iter().filter(|e| e.active).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TenantDirectory for MemoryBackend {
    async fn resolve(&self, platform: Platform, routing_key: &str) -> Result<Option<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .routes
            .get(&(platform, routing_key.to_string()))
            .copied())
    }
}

/// One recorded outbound send
#[derive(Debug, Clone)]
pub struct SentText {
    pub target: OutboundTarget,
    pub text: String,
}

#[derive(Default)]
struct SenderState {
    sent: Vec<SentText>,
    typing: usize,
    fail_after: Option<usize>,
    fail_reason: String,
    fail_typing: bool,
}

/// Channel sender that records instead of sending
#[derive(Clone, Default)]
pub struct RecordingSender {
    state: Arc<RwLock<SenderState>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send after `successes` successful ones
    pub async fn fail_after(&self, successes: usize, reason: &str) {
        let mut state = self.state.write().await;
        state.fail_after = Some(successes);
        state.fail_reason = reason.to_string();
    }

    pub async fn fail_typing(&self) {
        self.state.write().await.fail_typing = true;
    }

    pub async fn sent(&self) -> Vec<SentText> {
        self.state.read().await.sent.clone()
    }

    pub async fn typing_count(&self) -> usize {
        self.state.read().await.typing
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send_text(&self, target: &OutboundTarget, text: &str) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        if state.fail_after.is_some_and(|limit| state.sent.len() >= limit) {
            return Err(RelayError::Delivery(state.fail_reason.clone()));
        }
        state.sent.push(SentText {
            target: target.clone(),
            text: text.to_string(),
        });
        Ok(Some(format!("out-{}", state.sent.len())))
    }

    async fn send_typing(&self, _target: &OutboundTarget) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_typing {
            return Err(RelayError::Delivery("typing indicator rejected".to_string()));
        }
        state.typing += 1;
        Ok(())
    }
}

/// Blob store keeping uploads in memory
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, FetchedMedia>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, key: &str, media: &FetchedMedia) -> Result<String> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), media.clone());
        Ok(format!("memory://blobs/{}", key))
    }
}

/// Media fetcher serving pre-registered references
#[derive(Clone, Default)]
pub struct StaticMediaFetcher {
    media: Arc<RwLock<HashMap<String, FetchedMedia>>>,
}

impl StaticMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, reference: &str, media: FetchedMedia) {
        self.media.write().await.insert(reference.to_string(), media);
    }
}

#[async_trait]
impl MediaFetcher for StaticMediaFetcher {
    async fn fetch(
        &self,
        _organization_id: Uuid,
        platform: Platform,
        reference: &str,
    ) -> Result<FetchedMedia> {
        self.media
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| RelayError::Media(format!("unknown {} media '{}'", platform, reference)))
    }
}

/// One recorded model call
#[derive(Debug, Clone)]
pub struct RecordedGeneration {
    pub request: GenerationRequest,
    pub media_url: Option<String>,
}

struct ModelState {
    script: VecDeque<Result<String>>,
    default_reply: String,
    calls: Vec<RecordedGeneration>,
    latency: Duration,
}

/// Language model replaying scripted replies
#[derive(Clone)]
pub struct ScriptedModel {
    name: String,
    state: Arc<RwLock<ModelState>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new("Thanks for reaching out! How can I help you today?")
    }
}

impl ScriptedModel {
    /// Model answering `default_reply` once the script is exhausted
    pub fn new(default_reply: &str) -> Self {
        Self {
            name: "scripted".to_string(),
            state: Arc::new(RwLock::new(ModelState {
                script: VecDeque::new(),
                default_reply: default_reply.to_string(),
                calls: Vec::new(),
                latency: Duration::ZERO,
            })),
        }
    }

    pub async fn push_reply(&self, reply: &str) {
        self.state.write().await.script.push_back(Ok(reply.to_string()));
    }

    pub async fn push_error(&self, reason: &str) {
        self.state
            .write()
            .await
            .script
            .push_back(Err(RelayError::Model(reason.to_string())));
    }

    /// Simulated generation latency
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    pub async fn calls(&self) -> Vec<RecordedGeneration> {
        self.state.read().await.calls.clone()
    }

    async fn answer(&self, request: &GenerationRequest, media_url: Option<&str>) -> Result<Generation> {
        let latency = {
            let mut state = self.state.write().await;
            state.calls.push(RecordedGeneration {
                request: request.clone(),
                media_url: media_url.map(str::to_string),
            });
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().await;
        let text = match state.script.pop_front() {
            Some(scripted) => scripted?,
            None => state.default_reply.clone(),
        };
        Ok(Generation {
            text,
            model: request.model.clone().unwrap_or_else(|| self.name.clone()),
            confidence: 0.9,
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        self.answer(request, None).await
    }

    async fn generate_with_media(
        &self,
        request: &GenerationRequest,
        media_url: &str,
        _kind: MessageKind,
    ) -> Result<Generation> {
        self.answer(request, Some(media_url)).await
    }
}

/// Handles to every in-memory collaborator
#[derive(Clone, Default)]
pub struct MemoryServices {
    pub backend: MemoryBackend,
    pub sender: RecordingSender,
    pub blobs: MemoryBlobStore,
    pub media: StaticMediaFetcher,
    pub model: ScriptedModel,
}

impl MemoryServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle as trait objects
    pub fn services(&self) -> Services {
        Services {
            contacts: Arc::new(self.backend.clone()),
            conversations: Arc::new(self.backend.clone()),
            messages: Arc::new(self.backend.clone()),
            organizations: Arc::new(self.backend.clone()),
            tenants: Arc::new(self.backend.clone()),
            sender: Arc::new(self.sender.clone()),
            media: Arc::new(self.media.clone()),
            blobs: Arc::new(self.blobs.clone()),
            model: Arc::new(self.model.clone()),
        }
    }
}

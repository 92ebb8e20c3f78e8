//! Message normalization stage
//!
//! `WebhookReceived` → contact, conversation and message records →
//! `MessageCreated`. Every step is a lookup before a create so a
//! redelivered batch converges on the same records.

use super::EventHandler;
use crate::config::IngestConfig;
use crate::domain::{
    Attachment, Contact, Conversation, Direction, Message, MessageStatus, NewContact,
    NewConversation, NewMessage, Platform, SenderType,
};
use crate::error::{RelayError, Result};
use crate::events::{new_event_id, MessageCreated, WebhookReceived};
use crate::platform::WebhookMessage;
use crate::services::{OutboundTarget, Services};
use crate::store::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Publisher name on envelopes
pub const SOURCE: &str = "normalizer";

/// How long a rejected origin message id suppresses a repeat canned reply
const REJECTION_MEMORY: Duration = Duration::from_secs(60 * 60);

/// Persists inbound webhook messages
pub struct NormalizeStage {
    services: Services,
    bus: EventBus,
    config: IngestConfig,
    /// (organization, platform, origin message id) → when the canned reply went out
    rejected: Mutex<HashMap<(Uuid, Platform, String), Instant>>,
}

impl NormalizeStage {
    pub fn new(services: Services, bus: EventBus, config: IngestConfig) -> Self {
        Self {
            services,
            bus,
            config,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    async fn normalize(
        &self,
        batch: &WebhookReceived,
        inbound: &WebhookMessage,
    ) -> Result<Option<MessageCreated>> {
        let organization_id = batch.organization_id;
        let platform = batch.platform;

        let words = inbound.word_count();
        if words > self.config.max_inbound_word_count {
            self.reject_too_long(organization_id, platform, inbound, words).await;
            return Ok(None);
        }

        let contact = self
            .resolve_contact(organization_id, platform, &inbound.sender_identifier)
            .await?;
        let conversation = self
            .resolve_conversation(organization_id, contact.id, platform)
            .await?;
        let message = self.persist(&conversation, inbound).await?;

        if let Some(ref reference) = inbound.media_reference {
            if message.attachments.is_empty() {
                self.spawn_rehost(&message, platform, reference.clone());
            }
        }

        if let Err(e) = self
            .services
            .conversations
            .touch(conversation.id, message.created_at)
            .await
        {
            tracing::warn!(conversation_id = %conversation.id, error = %e, "Failed to touch conversation");
        }

        let created = MessageCreated {
            event_id: new_event_id(),
            message_id: message.id,
            conversation_id: conversation.id,
            organization_id,
            contact_id: contact.id,
            content: message.content.clone(),
            sender_type: message.sender_type,
            direction: message.direction,
            message_kind: message.kind,
            media_url: message.media_url.clone(),
            channel_message_id: message.channel_message_id.clone(),
            created_at: message.created_at,
        };
        self.bus.publish_typed(SOURCE, &created).await?;
        Ok(Some(created))
    }

    async fn reject_too_long(
        &self,
        organization_id: Uuid,
        platform: Platform,
        inbound: &WebhookMessage,
        words: usize,
    ) {
        let key = inbound
            .origin_message_id
            .clone()
            .map(|origin| (organization_id, platform, origin));
        if let Some(ref key) = key {
            let mut rejected = self.rejected.lock().await;
            rejected.retain(|_, at| at.elapsed() < REJECTION_MEMORY);
            if rejected.contains_key(key) {
                tracing::debug!(
                    organization_id = %organization_id,
                    origin_message_id = %key.2,
                    "Canned reply already sent for redelivered message"
                );
                return;
            }
        }

        tracing::info!(
            organization_id = %organization_id,
            platform = %platform,
            words,
            max_words = self.config.max_inbound_word_count,
            "Inbound message too long, sending canned reply"
        );
        let target = OutboundTarget {
            organization_id,
            platform,
            recipient: inbound.sender_identifier.clone(),
            reply_to: inbound.origin_message_id.clone(),
        };
        match self
            .services
            .sender
            .send_text(&target, &self.config.too_long_reply)
            .await
        {
            Ok(_) => {
                if let Some(key) = key {
                    self.rejected.lock().await.insert(key, Instant::now());
                }
            }
            Err(e) => {
                tracing::warn!(
                    organization_id = %organization_id,
                    recipient = %target.recipient,
                    error = %e,
                    "Failed to send too-long reply"
                );
            }
        }
    }

    /// Get-or-create; a lost creation race re-fetches the winner
    pub async fn resolve_contact(
        &self,
        organization_id: Uuid,
        platform: Platform,
        identifier: &str,
    ) -> Result<Contact> {
        let contacts = &self.services.contacts;
        if let Some(contact) = contacts
            .find_by_identifier(organization_id, platform, identifier)
            .await?
        {
            return Ok(contact);
        }

        let created = contacts
            .create(NewContact {
                organization_id,
                platform,
                identifier: identifier.to_string(),
                name: identifier.to_string(),
            })
            .await;
        match created {
            Ok(contact) => {
                tracing::info!(contact_id = %contact.id, platform = %platform, "Contact created");
                Ok(contact)
            }
            Err(RelayError::AlreadyExists(_)) => contacts
                .find_by_identifier(organization_id, platform, identifier)
                .await?
                .ok_or_else(|| RelayError::NotFound(format!("contact {} vanished after create", identifier))),
            Err(e) => Err(e),
        }
    }

    /// Get-or-create the active conversation
    pub async fn resolve_conversation(
        &self,
        organization_id: Uuid,
        contact_id: Uuid,
        platform: Platform,
    ) -> Result<Conversation> {
        let conversations = &self.services.conversations;
        if let Some(conversation) = conversations
            .find_active(organization_id, contact_id, platform)
            .await?
        {
            return Ok(conversation);
        }

        match conversations
            .create(NewConversation::open(organization_id, contact_id, platform))
            .await
        {
            Ok(conversation) => {
                tracing::info!(
                    conversation_id = %conversation.id,
                    contact_id = %contact_id,
                    "Conversation created"
                );
                Ok(conversation)
            }
            Err(RelayError::AlreadyExists(_)) => conversations
                .find_active(organization_id, contact_id, platform)
                .await?
                .ok_or_else(|| {
                    RelayError::NotFound(format!("conversation for contact {} vanished after create", contact_id))
                }),
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, conversation: &Conversation, inbound: &WebhookMessage) -> Result<Message> {
        let messages = &self.services.messages;
        if let Some(ref origin) = inbound.origin_message_id {
            if let Some(existing) = messages
                .find_by_channel_message_id(conversation.id, origin)
                .await?
            {
                tracing::debug!(message_id = %existing.id, origin = %origin, "Message already persisted");
                return Ok(existing);
            }
        }

        let created = messages
            .create(NewMessage {
                organization_id: conversation.organization_id,
                conversation_id: conversation.id,
                contact_id: conversation.contact_id,
                direction: Direction::Inbound,
                sender_type: SenderType::Contact,
                kind: inbound.message_kind,
                content: inbound.content.clone(),
                media_url: inbound.media_reference.clone(),
                channel_message_id: inbound.origin_message_id.clone(),
                in_reply_to: None,
                status: MessageStatus::Delivered,
                metadata: inbound.metadata.clone(),
            })
            .await;

        match (created, inbound.origin_message_id.as_deref()) {
            (Ok(message), _) => Ok(message),
            (Err(RelayError::AlreadyExists(_)), Some(origin)) => messages
                .find_by_channel_message_id(conversation.id, origin)
                .await?
                .ok_or_else(|| RelayError::NotFound(format!("message {} vanished after create", origin))),
            (Err(e), _) => Err(e),
        }
    }

    /// Download, re-host and patch media off the request path
    fn spawn_rehost(&self, message: &Message, platform: Platform, reference: String) -> JoinHandle<()> {
        let services = self.services.clone();
        let timeout = self.config.media_timeout();
        let organization_id = message.organization_id;
        let conversation_id = message.conversation_id;
        let message_id = message.id;

        tokio::spawn(async move {
            let work = rehost_media(&services, organization_id, conversation_id, message_id, platform, &reference);
            match tokio::time::timeout(timeout, work).await {
                Ok(Ok(url)) => {
                    tracing::info!(message_id = %message_id, url = %url, "Media re-hosted");
                }
                Ok(Err(e)) => {
                    tracing::warn!(message_id = %message_id, reference = %reference, error = %e, "Media re-hosting failed");
                }
                Err(_) => {
                    tracing::warn!(
                        message_id = %message_id,
                        reference = %reference,
                        timeout_secs = timeout.as_secs(),
                        "Media re-hosting timed out"
                    );
                }
            }
        })
    }
}

async fn rehost_media(
    services: &Services,
    organization_id: Uuid,
    conversation_id: Uuid,
    message_id: Uuid,
    platform: Platform,
    reference: &str,
) -> Result<String> {
    let media = services.media.fetch(organization_id, platform, reference).await?;
    let file_name = media
        .file_name
        .clone()
        .unwrap_or_else(|| message_id.to_string());
    let key = format!("{}/{}/{}/{}", organization_id, conversation_id, message_id, file_name);
    let url = services.blobs.upload(&key, &media).await?;

    let attachment = Attachment {
        url: url.clone(),
        content_type: media.content_type.clone(),
        file_name: media.file_name.clone(),
        size_bytes: Some(media.bytes.len() as u64),
    };
    services
        .messages
        .attach_media(message_id, url.clone(), attachment)
        .await?;
    Ok(url)
}

#[async_trait]
impl EventHandler for NormalizeStage {
    type Event = WebhookReceived;

    fn name(&self) -> &'static str {
        "normalizer"
    }

    async fn handle(&self, batch: WebhookReceived, cancel: CancellationToken) -> Result<()> {
        let mut published = 0usize;
        for inbound in &batch.messages {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled(format!(
                    "batch {} stopped after {} message(s)",
                    batch.event_id, published
                )));
            }
            if self.normalize(&batch, inbound).await?.is_some() {
                published += 1;
            }
        }

        tracing::info!(
            event_id = %batch.event_id,
            organization_id = %batch.organization_id,
            platform = %batch.platform,
            received = batch.messages.len(),
            published,
            "Webhook batch normalized"
        );
        Ok(())
    }
}

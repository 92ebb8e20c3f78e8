//! Reply dispatcher
//!
//! Persists each AI response as one outbound message and asks the
//! delivery stage to send it.

use super::EventHandler;
use crate::domain::{
    DeliveryMedium, Direction, Message, MessageKind, MessageStatus, NewMessage, Platform,
    SenderType,
};
use crate::error::{RelayError, Result};
use crate::events::{new_event_id, AiResponseReceived, MessageDelivery};
use crate::services::Services;
use crate::store::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Publisher name on envelopes
pub const SOURCE: &str = "dispatcher";

/// Turns AI responses into pending outbound messages
pub struct ReplyStage {
    services: Services,
    bus: EventBus,
}

impl ReplyStage {
    pub fn new(services: Services, bus: EventBus) -> Self {
        Self { services, bus }
    }

    /// The reply for the triggering message, created at most once
    async fn persist_reply(&self, event: &AiResponseReceived) -> Result<Message> {
        let messages = &self.services.messages;
        if let Some(existing) = messages.find_reply_to(event.message_id).await? {
            tracing::debug!(
                message_id = %existing.id,
                in_reply_to = %event.message_id,
                "Reply already persisted"
            );
            return Ok(existing);
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("model".into(), json!(event.model));
        metadata.insert("confidenceScore".into(), json!(event.confidence_score));
        metadata.insert("processingTimeMs".into(), json!(event.processing_time_ms));

        let created = messages
            .create(NewMessage {
                organization_id: event.organization_id,
                conversation_id: event.conversation_id,
                contact_id: event.contact_id,
                direction: Direction::Outbound,
                sender_type: SenderType::Ai,
                kind: MessageKind::Text,
                content: event.response.clone(),
                media_url: None,
                channel_message_id: None,
                in_reply_to: Some(event.message_id),
                status: MessageStatus::Pending,
                metadata,
            })
            .await;
        match created {
            Ok(message) => Ok(message),
            Err(RelayError::AlreadyExists(_)) => messages
                .find_reply_to(event.message_id)
                .await?
                .ok_or_else(|| {
                    RelayError::NotFound(format!("reply to {} vanished after create", event.message_id))
                }),
            Err(e) => Err(e),
        }
    }
}

/// Medium a platform's replies go out on
pub fn medium_for(platform: Platform) -> DeliveryMedium {
    match platform {
        Platform::Email => DeliveryMedium::Email,
        Platform::WhatsApp | Platform::Instagram | Platform::Facebook => DeliveryMedium::Chat,
    }
}

#[async_trait]
impl EventHandler for ReplyStage {
    type Event = AiResponseReceived;

    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn handle(&self, event: AiResponseReceived, _cancel: CancellationToken) -> Result<()> {
        let conversation = self.services.conversations.get(event.conversation_id).await?;
        let reply = self.persist_reply(&event).await?;

        if reply.status.is_settled() {
            tracing::debug!(message_id = %reply.id, status = ?reply.status, "Reply already delivered");
            return Ok(());
        }

        if let Err(e) = self
            .services
            .conversations
            .touch(conversation.id, reply.created_at)
            .await
        {
            tracing::warn!(conversation_id = %conversation.id, error = %e, "Failed to touch conversation");
        }

        let delivery = MessageDelivery {
            event_id: new_event_id(),
            message_id: reply.id,
            conversation_id: event.conversation_id,
            organization_id: event.organization_id,
            contact_id: event.contact_id,
            medium: medium_for(conversation.platform),
            channel_message_id: event.channel_message_id.clone(),
            created_at: Utc::now(),
        };
        self.bus.publish_typed(SOURCE, &delivery).await?;

        tracing::info!(
            message_id = %reply.id,
            in_reply_to = %event.message_id,
            medium = ?delivery.medium,
            "Reply queued for delivery"
        );
        Ok(())
    }
}

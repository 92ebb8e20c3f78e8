//! AI context & response stage
//!
//! `MessageCreated` → grounded generation → `AiResponseReceived`, followed
//! by a detached contact memory refresh.

use super::EventHandler;
use crate::analysis::ConversationAnalyzer;
use crate::config::{ContactMemoryConfig, ContextConfig};
use crate::contact_memory::MemoryUpdater;
use crate::context::{ContextAssembler, ContextKey};
use crate::error::{RelayError, Result};
use crate::events::{new_event_id, AiResponseReceived, MessageCreated};
use crate::services::{Generation, GenerationRequest, Services};
use crate::store::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Publisher name on envelopes
pub const SOURCE: &str = "responder";

/// Generates replies to customer messages
pub struct ResponseStage {
    services: Services,
    bus: EventBus,
    assembler: Arc<ContextAssembler>,
    memory: Arc<MemoryUpdater>,
}

impl ResponseStage {
    pub fn new(
        services: Services,
        bus: EventBus,
        analyzer: Arc<dyn ConversationAnalyzer>,
        context: ContextConfig,
        contact_memory: ContactMemoryConfig,
    ) -> Self {
        let assembler = Arc::new(ContextAssembler::new(
            services.organizations.clone(),
            services.contacts.clone(),
            services.messages.clone(),
            context,
        ));
        let memory = Arc::new(MemoryUpdater::new(
            services.contacts.clone(),
            services.messages.clone(),
            analyzer,
            assembler.contexts(),
            contact_memory,
        ));
        Self {
            services,
            bus,
            assembler,
            memory,
        }
    }

    /// Context builder, for cache invalidation hooks
    pub fn assembler(&self) -> &Arc<ContextAssembler> {
        &self.assembler
    }

    /// URL the model can read, once the media has been re-hosted
    async fn media_url(&self, event: &MessageCreated) -> Result<Option<String>> {
        if !event.message_kind.is_media() {
            return Ok(None);
        }
        let message = self.services.messages.get(event.message_id).await?;
        if let Some(attachment) = message.attachments.first() {
            return Ok(Some(attachment.url.clone()));
        }
        let direct = message
            .media_url
            .or_else(|| event.media_url.clone())
            .filter(|url| url.starts_with("https://") || url.starts_with("http://"));
        if direct.is_none() {
            tracing::debug!(
                message_id = %event.message_id,
                "Media not re-hosted yet, answering from text"
            );
        }
        Ok(direct)
    }

    async fn generate(&self, event: &MessageCreated, cancel: &CancellationToken) -> Result<Generation> {
        let key = ContextKey {
            organization_id: event.organization_id,
            contact_id: event.contact_id,
            conversation_id: event.conversation_id,
            trigger_message_id: event.message_id,
        };
        let context = self.assembler.assemble(key).await?;
        let prompt = self.assembler.organization_prompt(event.organization_id).await?;
        let request = GenerationRequest {
            organization_id: event.organization_id,
            context,
            message: event.content.clone(),
            model: prompt.ai_model,
        };

        let media_url = self.media_url(event).await?;
        let model = &self.services.model;
        let call = async {
            match media_url {
                Some(ref url) => model.generate_with_media(&request, url, event.message_kind).await,
                None => model.generate(&request).await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled(format!(
                "generation for message {} aborted",
                event.message_id
            ))),
            generation = call => generation,
        }
    }
}

#[async_trait]
impl EventHandler for ResponseStage {
    type Event = MessageCreated;

    fn name(&self) -> &'static str {
        "responder"
    }

    async fn handle(&self, event: MessageCreated, cancel: CancellationToken) -> Result<()> {
        if !event.wants_reply() {
            tracing::trace!(message_id = %event.message_id, "Not a customer message, skipping");
            return Ok(());
        }

        let conversation = self.services.conversations.get(event.conversation_id).await?;
        if !conversation.ai_enabled {
            tracing::debug!(
                conversation_id = %event.conversation_id,
                "AI disabled for conversation, skipping"
            );
            return Ok(());
        }

        let started = Instant::now();
        let generation = self.generate(&event, &cancel).await?;
        let response = generation.text.trim();
        if response.is_empty() {
            return Err(RelayError::Model(format!(
                "empty response for message {}",
                event.message_id
            )));
        }

        let processing_time_ms = started.elapsed().as_millis() as u64;
        let reply = AiResponseReceived {
            event_id: new_event_id(),
            message_id: event.message_id,
            conversation_id: event.conversation_id,
            organization_id: event.organization_id,
            contact_id: event.contact_id,
            response: response.to_string(),
            model: generation.model,
            confidence_score: generation.confidence,
            processing_time_ms,
            channel_message_id: event.channel_message_id.clone(),
            created_at: Utc::now(),
        };
        self.bus.publish_typed(SOURCE, &reply).await?;

        tracing::info!(
            message_id = %event.message_id,
            conversation_id = %event.conversation_id,
            model = %reply.model,
            processing_time_ms,
            "AI response published"
        );

        self.memory.spawn(event.contact_id, event.conversation_id);
        Ok(())
    }
}

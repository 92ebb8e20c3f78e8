//! Message delivery stage
//!
//! Sends a pending outbound message through the contact's channel, split
//! into paced chunks, then records `Sent` or `Failed`. Delivery failures
//! are terminal for this stage and never redelivered.

use super::EventHandler;
use crate::chunking::split_message;
use crate::config::DeliveryConfig;
use crate::domain::{DeliveryMedium, Message, StatusUpdate};
use crate::error::{RelayError, Result};
use crate::events::MessageDelivery;
use crate::services::{OutboundTarget, Services};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Sends outbound messages
pub struct DeliveryStage {
    services: Services,
    config: DeliveryConfig,
}

/// What a successful send produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub chunks_sent: usize,
    /// Provider id of the first chunk
    pub channel_message_id: Option<String>,
}

impl DeliveryStage {
    pub fn new(services: Services, config: DeliveryConfig) -> Self {
        Self { services, config }
    }

    async fn deliver(
        &self,
        message: &Message,
        target: &OutboundTarget,
        medium: DeliveryMedium,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport> {
        match medium {
            DeliveryMedium::Chat => self.deliver_chat(message, target, cancel).await,
            DeliveryMedium::Email | DeliveryMedium::Sms => Err(RelayError::NotImplemented(format!(
                "{:?} delivery",
                medium
            ))),
        }
    }

    async fn deliver_chat(
        &self,
        message: &Message,
        target: &OutboundTarget,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReport> {
        let chunks = split_message(&message.content, &self.config);
        if chunks.is_empty() {
            return Err(RelayError::Delivery("message has no content".to_string()));
        }

        if self.config.enable_typing_indicator {
            if let Err(e) = self.services.sender.send_typing(target).await {
                tracing::warn!(message_id = %message.id, error = %e, "Typing indicator failed");
            }
        }

        let sender = &self.services.sender;
        if chunks.len() == 1 {
            let channel_message_id = sender.send_text(target, &chunks[0]).await?;
            return Ok(DeliveryReport {
                chunks_sent: 1,
                channel_message_id,
            });
        }

        let delay = self.config.inter_chunk_delay();
        let mut first_id = None;
        for (sent, chunk) in chunks.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RelayError::Cancelled(format!(
                        "stopped after {} of {} chunks",
                        sent,
                        chunks.len()
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let id = sender.send_text(target, chunk).await.map_err(|e| {
                RelayError::Delivery(format!("chunk {} of {} failed: {}", sent + 1, chunks.len(), e))
            })?;
            if first_id.is_none() {
                first_id = id;
            }
        }

        Ok(DeliveryReport {
            chunks_sent: chunks.len(),
            channel_message_id: first_id,
        })
    }
}

#[async_trait]
impl EventHandler for DeliveryStage {
    type Event = MessageDelivery;

    fn name(&self) -> &'static str {
        "delivery"
    }

    async fn handle(&self, event: MessageDelivery, cancel: CancellationToken) -> Result<()> {
        let messages = &self.services.messages;
        let message = messages.get(event.message_id).await?;
        if message.status.is_settled() {
            tracing::debug!(message_id = %message.id, status = ?message.status, "Message already settled");
            return Ok(());
        }

        let contact = self.services.contacts.get(message.contact_id).await?;
        let target = OutboundTarget {
            organization_id: message.organization_id,
            platform: contact.platform,
            recipient: contact.identifier,
            reply_to: event.channel_message_id.clone(),
        };

        match self.deliver(&message, &target, event.medium, &cancel).await {
            Ok(report) => {
                messages
                    .update_status(message.id, StatusUpdate::sent(report.channel_message_id))
                    .await?;
                tracing::info!(
                    message_id = %message.id,
                    platform = %target.platform,
                    chunks = report.chunks_sent,
                    "Message sent"
                );
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    platform = %target.platform,
                    error = %e,
                    "Message delivery failed"
                );
                messages
                    .update_status(message.id, StatusUpdate::failed(e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}

//! JetStream pull-consumer subscription

use crate::error::{RelayError, Result};
use crate::provider::{PendingEvent, Subscription};
use crate::types::{Event, ReceivedEvent};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;

/// Subscription over a JetStream pull consumer message stream
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    stream: String,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, stream: String) -> Self {
        Self { messages, stream }
    }

    /// Pull the next message, skipping payloads that are not bus envelopes.
    ///
    /// Undecodable messages are terminated so JetStream stops redelivering them.
    async fn pull(&mut self) -> Result<Option<(jetstream::Message, ReceivedEvent)>> {
        loop {
            let Some(msg) = self.messages.next().await else {
                return Ok(None);
            };
            let msg = msg.map_err(|e| RelayError::Consumer(format!("Pull failed: {}", e)))?;

            let event = match serde_json::from_slice::<Event>(&msg.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        subject = %msg.subject,
                        error = %e,
                        "Dropping message that is not a bus envelope"
                    );
                    if let Err(e) = msg.ack_with(jetstream::AckKind::Term).await {
                        tracing::warn!(error = %e, "Failed to terminate undecodable message");
                    }
                    continue;
                }
            };

            let (sequence, num_delivered) = match msg.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(_) => (0, 1),
            };

            let received = ReceivedEvent {
                event,
                sequence,
                num_delivered,
                stream: self.stream.clone(),
            };
            return Ok(Some((msg, received)));
        }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<ReceivedEvent>> {
        let Some((msg, received)) = self.pull().await? else {
            return Ok(None);
        };
        msg.ack()
            .await
            .map_err(|e| RelayError::Ack(e.to_string()))?;
        Ok(Some(received))
    }

    async fn next_manual_ack(&mut self) -> Result<Option<PendingEvent>> {
        let Some((msg, received)) = self.pull().await? else {
            return Ok(None);
        };

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let nak_msg = msg;

        Ok(Some(PendingEvent::new(
            received,
            move || {
                async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| RelayError::Ack(e.to_string()))
                }
                .boxed()
            },
            move || {
                async move {
                    nak_msg
                        .ack_with(jetstream::AckKind::Nak(None))
                        .await
                        .map_err(|e| RelayError::Ack(e.to_string()))
                }
                .boxed()
            },
        )))
    }
}

//! WhatsApp Cloud API webhook parser

use super::{decode_each, decode_envelope, PlatformProcessor, WebhookMessage};
use crate::domain::{MessageKind, Platform};
use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::collections::HashMap;

const OBJECT: &str = "whatsapp_business_account";

/// Parser for `whatsapp_business_account` webhooks
#[derive(Debug, Clone, Copy, Default)]
pub struct WhatsAppProcessor;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    object: Option<String>,
    entry: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    changes: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    field: Option<String>,
    value: ChangeValue,
}

#[derive(Debug, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    metadata: Option<PhoneMetadata>,
    #[serde(default)]
    contacts: Vec<serde_json::Value>,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PhoneMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Contact {
    wa_id: String,
    #[serde(default)]
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: String,
    id: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<Text>,
    #[serde(default)]
    image: Option<Media>,
    #[serde(default)]
    video: Option<Media>,
    #[serde(default)]
    audio: Option<Media>,
    #[serde(default)]
    document: Option<Media>,
    #[serde(default)]
    sticker: Option<Media>,
    #[serde(default)]
    location: Option<Location>,
    #[serde(default)]
    interactive: Option<Interactive>,
    #[serde(default)]
    button: Option<Button>,
    #[serde(default)]
    context: Option<Context>,
}

#[derive(Debug, Deserialize)]
struct Text {
    body: String,
}

#[derive(Debug, Deserialize)]
struct Media {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Location {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Interactive {
    #[serde(default)]
    button_reply: Option<Reply>,
    #[serde(default)]
    list_reply: Option<Reply>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct Button {
    text: String,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Context {
    #[serde(default)]
    id: Option<String>,
}

impl Message {
    fn into_webhook_message(self) -> Option<WebhookMessage> {
        let base = |content: String| {
            WebhookMessage::text(self.from.clone(), content).with_origin_id(self.id.clone())
        };

        let msg = match self.kind.as_str() {
            "text" => base(self.text.as_ref()?.body.clone()),
            "image" | "video" | "audio" | "document" => {
                let kind = MessageKind::from_tag(&self.kind);
                let media = match kind {
                    MessageKind::Image => self.image.as_ref(),
                    MessageKind::Video => self.video.as_ref(),
                    MessageKind::Audio => self.audio.as_ref(),
                    _ => self.document.as_ref(),
                }?;
                let content = media
                    .caption
                    .clone()
                    .or_else(|| media.filename.clone())
                    .unwrap_or_default();
                base(content)
                    .with_media(kind, media.id.clone())
                    .with_metadata("mimeType", media.mime_type.clone())
                    .with_metadata("fileName", media.filename.clone())
            }
            "sticker" => {
                let sticker = self.sticker.as_ref()?;
                base("[sticker]".to_string())
                    .with_kind(MessageKind::Sticker)
                    .with_metadata("stickerId", Some(sticker.id.clone()))
            }
            "location" => {
                let location = self.location.as_ref()?;
                let content = match (&location.name, &location.address) {
                    (Some(name), Some(address)) => format!("{}, {}", name, address),
                    (Some(label), None) | (None, Some(label)) => label.clone(),
                    (None, None) => format!("{}, {}", location.latitude, location.longitude),
                };
                base(content)
                    .with_kind(MessageKind::Location)
                    .with_metadata("latitude", Some(location.latitude))
                    .with_metadata("longitude", Some(location.longitude))
            }
            "interactive" => {
                let interactive = self.interactive.as_ref()?;
                let reply = interactive
                    .button_reply
                    .as_ref()
                    .or(interactive.list_reply.as_ref())?;
                base(reply.title.clone())
                    .with_kind(MessageKind::Interactive)
                    .with_metadata("replyId", Some(reply.id.clone()))
            }
            "button" => {
                let button = self.button.as_ref()?;
                base(button.text.clone())
                    .with_kind(MessageKind::Interactive)
                    .with_metadata("buttonPayload", button.payload.clone())
            }
            other => {
                tracing::debug!(message_type = other, id = %self.id, "Ignoring unsupported WhatsApp message type");
                return None;
            }
        };

        Some(
            msg.with_metadata("timestamp", self.timestamp.clone())
                .with_metadata("contextMessageId", self.context.and_then(|c| c.id)),
        )
    }
}

impl PlatformProcessor for WhatsAppProcessor {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    fn validate_payload(&self, raw: &serde_json::Value) -> Result<()> {
        let envelope: Envelope = decode_envelope(raw, Platform::WhatsApp)?;
        match envelope.object.as_deref() {
            None | Some(OBJECT) => Ok(()),
            Some(other) => Err(RelayError::InvalidPayload(format!(
                "unexpected WhatsApp webhook object '{}'",
                other
            ))),
        }
    }

    fn extract_messages(&self, raw: &serde_json::Value) -> Result<Vec<WebhookMessage>> {
        let envelope: Envelope = decode_envelope(raw, Platform::WhatsApp)?;
        let mut out = Vec::new();

        for entry in decode_each::<Entry>(&envelope.entry, "whatsapp.entry") {
            for change in decode_each::<Change>(&entry.changes, "whatsapp.change") {
                if change.field.as_deref().is_some_and(|f| f != "messages") {
                    continue;
                }
                let value = change.value;

                let names: HashMap<String, String> =
                    decode_each::<Contact>(&value.contacts, "whatsapp.contact")
                        .into_iter()
                        .filter_map(|c| c.profile.map(|p| (c.wa_id, p.name)))
                        .collect();
                let phone_number_id = value.metadata.and_then(|m| m.phone_number_id);

                for message in decode_each::<Message>(&value.messages, "whatsapp.message") {
                    let sender_name = names.get(&message.from).cloned();
                    if let Some(msg) = message.into_webhook_message() {
                        out.push(
                            msg.with_metadata("senderName", sender_name)
                                .with_metadata("phoneNumberId", phone_number_id.clone()),
                        );
                    }
                }
            }
        }

        Ok(out)
    }
}

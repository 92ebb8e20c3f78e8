//! Meta Messenger-platform envelope shared by Instagram and Facebook
//!
//! Both deliver `entry[].messaging[]` events with the same message and
//! attachment shapes; only the `object` tag and postback support differ.

use super::{decode_each, decode_envelope, WebhookMessage};
use crate::domain::{MessageKind, Platform};
use crate::error::{RelayError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    object: Option<String>,
    entry: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    messaging: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Party {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: Party,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    postback: Option<Postback>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    attachments: Vec<serde_json::Value>,
    #[serde(default)]
    quick_reply: Option<QuickReply>,
    #[serde(default)]
    reply_to: Option<ReplyTo>,
}

#[derive(Debug, Deserialize)]
struct QuickReply {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct ReplyTo {
    #[serde(default)]
    mid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Postback {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

/// Shape check shared by both processors
pub(super) fn validate(raw: &serde_json::Value, platform: Platform, object: &str) -> Result<()> {
    let envelope: Envelope = decode_envelope(raw, platform)?;
    match envelope.object.as_deref() {
        Some(found) if found == object => Ok(()),
        Some(found) => Err(RelayError::InvalidPayload(format!(
            "expected {} webhook object '{}', got '{}'",
            platform, object, found
        ))),
        None => Err(RelayError::InvalidPayload(format!(
            "{} webhook is missing 'object'",
            platform
        ))),
    }
}

/// Extract messages (and postbacks when `postbacks` is set)
pub(super) fn extract(
    raw: &serde_json::Value,
    platform: Platform,
    postbacks: bool,
) -> Result<Vec<WebhookMessage>> {
    let envelope: Envelope = decode_envelope(raw, platform)?;
    let mut out = Vec::new();

    for entry in decode_each::<Entry>(&envelope.entry, "messaging.entry") {
        for event in decode_each::<MessagingEvent>(&entry.messaging, "messaging.event") {
            let sender = event.sender.id;
            let stamp = |msg: WebhookMessage| {
                msg.with_metadata("timestamp", event.timestamp)
                    .with_metadata("recipientPageId", entry.id.clone())
            };

            if let Some(message) = event.message {
                if message.is_echo {
                    continue;
                }
                for msg in message_descriptors(&sender, message) {
                    out.push(stamp(msg));
                }
            } else if let Some(postback) = event.postback.filter(|_| postbacks) {
                let Some(content) = postback.title.clone().or_else(|| postback.payload.clone()) else {
                    continue;
                };
                let mut msg = WebhookMessage::text(sender.clone(), content)
                    .with_kind(MessageKind::Interactive)
                    .with_metadata("postbackPayload", postback.payload);
                if let Some(mid) = postback.mid {
                    msg = msg.with_origin_id(mid);
                }
                out.push(stamp(msg));
            }
        }
    }

    Ok(out)
}

/// Text first, then one descriptor per attachment
fn message_descriptors(sender: &str, message: Message) -> Vec<WebhookMessage> {
    let mut descriptors = Vec::new();

    if let Some(text) = message.text.filter(|t| !t.trim().is_empty()) {
        descriptors.push(
            WebhookMessage::text(sender, text)
                .with_metadata("quickReplyPayload", message.quick_reply.map(|q| q.payload)),
        );
    }

    for attachment in decode_each::<Attachment>(&message.attachments, "messaging.attachment") {
        let Some(payload) = attachment.payload else {
            continue;
        };
        let Some(url) = payload.url else {
            continue;
        };
        let kind = MessageKind::from_tag(&attachment.kind);
        let msg = WebhookMessage::text(sender, payload.title.unwrap_or_default());
        descriptors.push(if kind.is_media() {
            msg.with_media(kind, url)
        } else {
            msg.with_kind(kind).with_metadata("url", Some(url))
        });
    }

    let reply_to = message.reply_to.and_then(|r| r.mid);
    let single = descriptors.len() == 1;
    for (index, msg) in descriptors.iter_mut().enumerate() {
        if let Some(ref mid) = message.mid {
            msg.origin_message_id = Some(if single || index == 0 {
                mid.clone()
            } else {
                format!("{}#{}", mid, index)
            });
        }
        if let Some(ref reply_to) = reply_to {
            msg.metadata
                .insert("replyToMessageId".to_string(), reply_to.clone().into());
        }
    }

    descriptors
}

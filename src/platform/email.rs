//! Inbound email parser
//!
//! Accepts the generic inbound-parse JSON most mail gateways emit, either a
//! single message object or `{"messages": [...]}`.

use super::{decode_each, decode_envelope, kind_from_mime, PlatformProcessor, WebhookMessage};
use crate::domain::Platform;
use crate::error::{RelayError, Result};
use serde::Deserialize;

/// Parser for inbound email webhooks
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailProcessor;

#[derive(Debug, Deserialize)]
struct Batch {
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Address {
    Plain(String),
    Structured {
        email: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl Address {
    /// (lower-cased bare address, display name)
    fn parts(&self) -> Option<(String, Option<String>)> {
        match self {
            Address::Structured { email, name } => {
                let email = email.trim().to_ascii_lowercase();
                (!email.is_empty()).then(|| (email, name.clone().filter(|n| !n.is_empty())))
            }
            Address::Plain(raw) => {
                let raw = raw.trim();
                match (raw.rfind('<'), raw.rfind('>')) {
                    (Some(open), Some(close)) if open < close => {
                        let email = raw[open + 1..close].trim().to_ascii_lowercase();
                        let name = raw[..open].trim().trim_matches('"').trim();
                        (!email.is_empty())
                            .then(|| (email, (!name.is_empty()).then(|| name.to_string())))
                    }
                    _ if raw.contains('@') => Some((raw.to_ascii_lowercase(), None)),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEmail {
    from: Address,
    #[serde(default)]
    to: Option<serde_json::Value>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default, alias = "message_id", alias = "Message-Id")]
    message_id: Option<String>,
    #[serde(default)]
    attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailAttachment {
    url: String,
    #[serde(default, alias = "filename")]
    file_name: Option<String>,
    #[serde(default, alias = "content_type")]
    content_type: Option<String>,
}

impl InboundEmail {
    fn into_messages(self) -> Vec<WebhookMessage> {
        let Some((sender, name)) = self.from.parts() else {
            tracing::warn!("Skipping email without a usable sender address");
            return Vec::new();
        };

        let body = match (self.text.as_deref(), self.html.as_deref()) {
            (Some(text), _) if !text.trim().is_empty() => text.trim().to_string(),
            (_, Some(html)) => html_to_text(html).unwrap_or_default(),
            _ => String::new(),
        };
        let subject = self.subject.as_deref().map(str::trim).unwrap_or_default();
        let content = match (subject.is_empty(), body.is_empty()) {
            (false, false) => format!("{}\n\n{}", subject, body),
            (false, true) => subject.to_string(),
            _ => body,
        };

        let recipient = self.to.as_ref().and_then(|to| match to {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(list) => list.first().and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        });

        let base = |content: String| {
            WebhookMessage::text(sender.clone(), content)
                .with_metadata("senderName", name.clone())
                .with_metadata("subject", self.subject.clone())
                .with_metadata("to", recipient.clone())
        };

        let mut out = Vec::new();
        if !content.is_empty() {
            let mut msg = base(content);
            if let Some(ref id) = self.message_id {
                msg = msg.with_origin_id(id.clone());
            }
            out.push(msg);
        }

        let attachments = decode_each::<EmailAttachment>(&self.attachments, "email.attachment");
        for (index, attachment) in attachments.into_iter().enumerate() {
            let kind = kind_from_mime(attachment.content_type.as_deref());
            let mut msg = base(attachment.file_name.clone().unwrap_or_default())
                .with_media(kind, attachment.url)
                .with_metadata("fileName", attachment.file_name)
                .with_metadata("mimeType", attachment.content_type);
            if let Some(ref id) = self.message_id {
                msg = msg.with_origin_id(format!("{}#att{}", id, index));
            }
            out.push(msg);
        }

        out
    }
}

/// Wide enough that html2text never wraps inside a word
const HTML_RENDER_WIDTH: usize = 1000;

/// Render an HTML body as one line of plain text
///
/// `<head>`, `<style>` and `<script>` content is not rendered.
pub(crate) fn html_to_text(html: &str) -> Option<String> {
    match html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH) {
        Ok(text) => Some(text.split_whitespace().collect::<Vec<_>>().join(" ")),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to render email HTML body");
            None
        }
    }
}

impl PlatformProcessor for EmailProcessor {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    fn validate_payload(&self, raw: &serde_json::Value) -> Result<()> {
        let obj = raw.as_object().ok_or_else(|| {
            RelayError::InvalidPayload("email payload must be a JSON object".to_string())
        })?;
        match obj.get("messages") {
            Some(serde_json::Value::Array(_)) => Ok(()),
            Some(_) => Err(RelayError::InvalidPayload(
                "email 'messages' must be an array".to_string(),
            )),
            None if obj.contains_key("from") => Ok(()),
            None => Err(RelayError::InvalidPayload(
                "email payload has neither 'from' nor 'messages'".to_string(),
            )),
        }
    }

    fn extract_messages(&self, raw: &serde_json::Value) -> Result<Vec<WebhookMessage>> {
        let fragments = if raw.get("messages").is_some() {
            decode_envelope::<Batch>(raw, Platform::Email)?.messages
        } else {
            vec![raw.clone()]
        };

        Ok(decode_each::<InboundEmail>(&fragments, "email.message")
            .into_iter()
            .flat_map(InboundEmail::into_messages)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageKind;
    use serde_json::json;

    #[test]
    fn test_single_email() {
        let raw = json!({
            "from": "Jane Doe <Jane.Doe@Example.com>",
            "to": "support@acme.test",
            "subject": "Order 1234",
            "text": "Where is my order?",
            "messageId": "<abc@mail>"
        });

        let messages = EmailProcessor.extract_messages(&raw).unwrap();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.sender_identifier, "jane.doe@example.com");
        assert_eq!(msg.content, "Order 1234\n\nWhere is my order?");
        assert_eq!(msg.sender_name(), Some("Jane Doe"));
        assert_eq!(msg.origin_message_id.as_deref(), Some("<abc@mail>"));
        assert_eq!(msg.metadata["to"], "support@acme.test");
    }

    #[test]
    fn test_batch_with_html_and_attachments() {
        let raw = json!({"messages": [
            {
                "from": {"email": "bob@x.io", "name": "Bob"},
                "html": "<p>Hi&nbsp;there,</p><p>see the invoice</p>",
                "message_id": "m-1",
                "attachments": [
                    {"url": "https://files/inv.pdf", "filename": "inv.pdf", "contentType": "application/pdf"},
                    {"filename": "no-url.png"}
                ]
            },
            {"to": "nobody"}
        ]});

        let messages = EmailProcessor.extract_messages(&raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hi there, see the invoice");
        assert_eq!(messages[1].message_kind, MessageKind::Document);
        assert_eq!(messages[1].media_reference.as_deref(), Some("https://files/inv.pdf"));
        assert_eq!(messages[1].origin_message_id.as_deref(), Some("m-1#att0"));
    }

    #[test]
    fn test_html_entities_decoded() {
        assert_eq!(html_to_text("a &amp; b<br/>c &lt;d&gt;").unwrap(), "a & b c <d>");
    }

    #[test]
    fn test_html_style_and_script_not_rendered() {
        let html = "<html><head><style>body { font-family: Arial; color: #333 }</style>\
                    <script>track('open')</script></head>\
                    <body><p>Where is my order?</p></body></html>";
        assert_eq!(html_to_text(html).unwrap(), "Where is my order?");

        let raw = json!({"from": "ana@shop.test", "html": html});
        let messages = EmailProcessor.extract_messages(&raw).unwrap();
        assert_eq!(messages[0].content, "Where is my order?");
    }

    #[test]
    fn test_validate_payload() {
        assert!(EmailProcessor.validate_payload(&json!({"from": "a@b.c"})).is_ok());
        assert!(EmailProcessor.validate_payload(&json!({"messages": []})).is_ok());
        assert!(EmailProcessor.validate_payload(&json!({"messages": {}})).is_err());
        assert!(EmailProcessor.validate_payload(&json!({"subject": "x"})).is_err());
        assert!(EmailProcessor.validate_payload(&json!("x")).is_err());
    }
}

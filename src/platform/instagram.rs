//! Instagram Messaging webhook parser

use super::{messaging, PlatformProcessor, WebhookMessage};
use crate::domain::Platform;
use crate::error::Result;

/// Parser for `object = "instagram"` webhooks
#[derive(Debug, Clone, Copy, Default)]
pub struct InstagramProcessor;

impl PlatformProcessor for InstagramProcessor {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn validate_payload(&self, raw: &serde_json::Value) -> Result<()> {
        messaging::validate(raw, Platform::Instagram, "instagram")
    }

    fn extract_messages(&self, raw: &serde_json::Value) -> Result<Vec<WebhookMessage>> {
        messaging::extract(raw, Platform::Instagram, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageKind;
    use serde_json::json;

    fn payload(messaging: serde_json::Value) -> serde_json::Value {
        json!({
            "object": "instagram",
            "entry": [{"id": "ig-page", "time": 1700000000, "messaging": messaging}]
        })
    }

    #[test]
    fn test_extract_text_and_attachments() {
        let raw = payload(json!([{
            "sender": {"id": "ig-user-1"},
            "recipient": {"id": "ig-page"},
            "timestamp": 1700000000123i64,
            "message": {
                "mid": "m_1",
                "text": "look at this",
                "attachments": [
                    {"type": "image", "payload": {"url": "https://cdn.example/a.jpg"}},
                    {"type": "video", "payload": {"url": "https://cdn.example/b.mp4"}}
                ]
            }
        }]));

        let messages = InstagramProcessor.extract_messages(&raw).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "look at this");
        assert_eq!(messages[0].origin_message_id.as_deref(), Some("m_1"));
        assert_eq!(messages[1].message_kind, MessageKind::Image);
        assert_eq!(messages[1].media_reference.as_deref(), Some("https://cdn.example/a.jpg"));
        assert_eq!(messages[1].origin_message_id.as_deref(), Some("m_1#1"));
        assert_eq!(messages[2].message_kind, MessageKind::Video);
        assert_eq!(messages[2].metadata["recipientPageId"], "ig-page");
    }

    #[test]
    fn test_skips_echoes_reads_and_postbacks() {
        let raw = payload(json!([
            {"sender": {"id": "page"}, "message": {"mid": "m_e", "text": "echo", "is_echo": true}},
            {"sender": {"id": "u"}, "read": {"mid": "m_r"}},
            {"sender": {"id": "u"}, "postback": {"title": "Start", "payload": "GET_STARTED"}},
            {"sender": {"id": "u"}, "message": {"mid": "m_2", "text": "real"}}
        ]));

        let messages = InstagramProcessor.extract_messages(&raw).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "real");
        assert_eq!(messages[0].sender_identifier, "u");
    }

    #[test]
    fn test_validate_requires_instagram_object() {
        assert!(InstagramProcessor.validate_payload(&payload(json!([]))).is_ok());
        assert!(InstagramProcessor
            .validate_payload(&json!({"object": "page", "entry": []}))
            .is_err());
        assert!(InstagramProcessor.validate_payload(&json!({"entry": []})).is_err());
    }
}

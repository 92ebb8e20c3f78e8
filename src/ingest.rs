//! Webhook ingestion
//!
//! Validates a raw webhook, dispatches it to the platform processor, and
//! publishes exactly one `WebhookReceived` per non-empty parsed batch.

use crate::domain::Platform;
use crate::error::{RelayError, Result};
use crate::events::{new_event_id, WebhookReceived};
use crate::platform::ProcessorRegistry;
use crate::services::TenantDirectory;
use crate::store::EventBus;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Publisher name on envelopes
pub const SOURCE: &str = "ingest";

/// How the webhook identifies its tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantHint {
    /// Tenant id carried by the webhook URL
    Organization(Uuid),
    /// Platform routing key (page id, phone number id, inbox address)
    RoutingKey(String),
}

/// Entry point for raw platform webhooks
#[derive(Clone)]
pub struct WebhookHandler {
    bus: EventBus,
    processors: ProcessorRegistry,
    tenants: Arc<dyn TenantDirectory>,
}

impl WebhookHandler {
    pub fn new(bus: EventBus, processors: ProcessorRegistry, tenants: Arc<dyn TenantDirectory>) -> Self {
        Self {
            bus,
            processors,
            tenants,
        }
    }

    /// Handle a raw request body
    pub async fn handle_bytes(
        &self,
        platform: &str,
        tenant: TenantHint,
        body: &[u8],
    ) -> Result<Option<WebhookReceived>> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(RelayError::EmptyPayload);
        }
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidPayload(format!("body is not JSON: {}", e)))?;
        self.handle(platform, tenant, raw).await
    }

    /// Handle a decoded payload
    ///
    /// Returns the published event, or `None` when the payload held no
    /// messages (delivery receipts, echoes, ...).
    pub async fn handle(
        &self,
        platform: &str,
        tenant: TenantHint,
        raw: serde_json::Value,
    ) -> Result<Option<WebhookReceived>> {
        if is_empty_payload(&raw) {
            return Err(RelayError::EmptyPayload);
        }

        let processor = self.processors.get(platform)?;
        let platform = processor.platform();
        processor.validate_payload(&raw)?;

        let messages = processor.extract_messages(&raw).map_err(|e| {
            tracing::warn!(platform = %platform, error = %e, "Webhook extraction failed");
            e
        })?;
        if messages.is_empty() {
            tracing::debug!(platform = %platform, "Webhook carried no messages");
            return Ok(None);
        }

        let organization_id = self.resolve_tenant(platform, tenant).await?;
        let event = WebhookReceived {
            event_id: new_event_id(),
            platform,
            organization_id,
            channel_id: processor.channel_id(),
            messages,
            raw_payload: raw,
            received_at: Utc::now(),
        };

        self.bus.publish_typed(SOURCE, &event).await?;

        tracing::info!(
            event_id = %event.event_id,
            platform = %platform,
            organization_id = %organization_id,
            messages = event.messages.len(),
            "Webhook accepted"
        );
        Ok(Some(event))
    }

    async fn resolve_tenant(&self, platform: Platform, tenant: TenantHint) -> Result<Uuid> {
        match tenant {
            TenantHint::Organization(id) => Ok(id),
            TenantHint::RoutingKey(key) => self
                .tenants
                .resolve(platform, &key)
                .await?
                .ok_or_else(|| {
                    RelayError::NotFound(format!("no organization for {} routing key '{}'", platform, key))
                }),
        }
    }
}

fn is_empty_payload(raw: &serde_json::Value) -> bool {
    match raw {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Verify a Meta `X-Hub-Signature-256` header (`sha256=<hex>`)
pub fn verify_signature(body: &[u8], signature_header: &str, app_secret: &str) -> bool {
    let Some(expected) = signature_header.strip_prefix("sha256=") else {
        tracing::warn!("Signature header is missing the sha256= prefix");
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        tracing::warn!("Failed to initialize HMAC");
        return false;
    };
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());

    constant_time_eq(computed.as_bytes(), expected.to_ascii_lowercase().as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Answer the `hub.mode=subscribe` verification handshake
///
/// Returns the challenge to echo back when the token matches.
pub fn verify_subscription<'a>(
    mode: Option<&str>,
    verify_token: Option<&str>,
    challenge: Option<&'a str>,
    expected_token: &str,
) -> Option<&'a str> {
    match (mode, verify_token) {
        (Some("subscribe"), Some(token))
            if !expected_token.is_empty()
                && constant_time_eq(token.as_bytes(), expected_token.as_bytes()) =>
        {
            challenge
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use crate::provider::memory::MemoryProvider;
    use crate::services::memory::MemoryBackend;
    use serde_json::json;

    fn handler() -> (WebhookHandler, EventBus, MemoryBackend) {
        let bus = EventBus::new(MemoryProvider::default());
        let backend = MemoryBackend::new();
        let handler = WebhookHandler::new(
            bus.clone(),
            ProcessorRegistry::with_defaults(),
            Arc::new(backend.clone()),
        );
        (handler, bus, backend)
    }

    fn whatsapp(messages: serde_json::Value) -> serde_json::Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {"messages": messages}}]}]
        })
    }

    #[tokio::test]
    async fn test_publishes_one_event_with_parsed_messages() {
        let (handler, bus, _) = handler();
        let org = Uuid::new_v4();
        let raw = whatsapp(json!([
            {"from": "1", "id": "a", "type": "text", "text": {"body": "one"}},
            {"from": "1", "id": "b", "type": "text", "text": {"body": "two"}}
        ]));

        let event = handler
            .handle("whatsapp", TenantHint::Organization(org), raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.messages.len(), 2);
        assert_eq!(event.channel_id, 1);

        let published = bus.list_events(None, 10).await.unwrap();
        assert_eq!(published.len(), 1);
        let decoded = WebhookReceived::from_event(&published[0]).unwrap();
        assert_eq!(decoded.organization_id, org);
        assert_eq!(decoded.messages, event.messages);
    }

    #[tokio::test]
    async fn test_empty_payloads_rejected() {
        let (handler, bus, _) = handler();
        let org = TenantHint::Organization(Uuid::new_v4());

        let bodies: [&[u8]; 4] = [b"", b"   ", b"{}", b"null"];
        for body in bodies {
            let err = handler.handle_bytes("whatsapp", org.clone(), body).await.unwrap_err();
            assert!(matches!(err, RelayError::EmptyPayload), "body {:?}", body);
        }
        let err = handler.handle_bytes("whatsapp", org, b"{oops").await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
        assert!(bus.list_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_platform() {
        let (handler, _, _) = handler();
        let err = handler
            .handle("telegram", TenantHint::Organization(Uuid::nil()), json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(err.is_malformed_input());
    }

    #[tokio::test]
    async fn test_zero_messages_is_not_an_error() {
        let (handler, bus, _) = handler();
        let outcome = handler
            .handle(
                "whatsapp",
                TenantHint::RoutingKey("unknown-page".into()),
                whatsapp(json!([])),
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(bus.list_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_routing_key_resolution() {
        let (handler, _, backend) = handler();
        let org = Uuid::new_v4();
        backend.add_route(Platform::Facebook, "page-1", org).await;
        let raw = json!({"object": "page", "entry": [{"id": "page-1", "messaging": [
            {"sender": {"id": "psid"}, "message": {"mid": "m", "text": "hi"}}
        ]}]});

        let event = handler
            .handle("facebook", TenantHint::RoutingKey("page-1".into()), raw.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.organization_id, org);

        let err = handler
            .handle("facebook", TenantHint::RoutingKey("page-2".into()), raw)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"object":"page"}"#;
        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(body, &header, "app-secret"));
        assert!(!verify_signature(body, &header, "other-secret"));
        assert!(!verify_signature(b"tampered", &header, "app-secret"));
        assert!(!verify_signature(body, "md5=abc", "app-secret"));
    }

    #[test]
    fn test_verify_subscription() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("tok"), Some("12345"), "tok"),
            Some("12345")
        );
        assert_eq!(verify_subscription(Some("subscribe"), Some("bad"), Some("1"), "tok"), None);
        assert_eq!(verify_subscription(Some("unsubscribe"), Some("tok"), Some("1"), "tok"), None);
        assert_eq!(verify_subscription(Some("subscribe"), Some(""), Some("1"), ""), None);
    }
}

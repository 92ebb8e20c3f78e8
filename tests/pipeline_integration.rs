//! Pipeline integration tests
//!
//! End-to-end runs over the in-memory bus: webhook in, paced reply out.
//! Covers the happy path, chunked replies, the too-long guard, retries,
//! dead-lettering, duplicate webhooks and delivery failures.

use a3s_relay::config::{DeliveryConfig, WorkerConfig};
use a3s_relay::domain::{Direction, Message, MessageStatus, Platform, SenderType};
use a3s_relay::services::memory::{MemoryServices, SentText};
use a3s_relay::{
    DlqHandler, MemoryDlqHandler, MemoryProvider, Pipeline, RelayConfig, RelayError, TenantHint,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Snapshot {
    sent: Vec<SentText>,
    messages: Vec<Message>,
    dead_lettered: usize,
}

impl Snapshot {
    fn outbound(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Outbound)
    }
}

struct Harness {
    memory: MemoryServices,
    pipeline: Pipeline,
    dlq: Arc<MemoryDlqHandler>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(config: RelayConfig) -> Self {
        let memory = MemoryServices::new();
        memory
            .backend
            .add_route(Platform::WhatsApp, "pn-1", Uuid::new_v4())
            .await;

        let dlq = Arc::new(MemoryDlqHandler::default());
        let pipeline = Pipeline::builder(Arc::new(MemoryProvider::default()), memory.services())
            .config(config)
            .dlq(dlq.clone())
            .build()
            .unwrap();
        pipeline.ensure_consumers().await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = pipeline.start(shutdown.clone());
        Self {
            memory,
            pipeline,
            dlq,
            shutdown,
            handles,
        }
    }

    async fn post(&self, messages: serde_json::Value) {
        let body = serde_json::to_vec(&whatsapp_webhook(messages)).unwrap();
        self.pipeline
            .webhooks()
            .handle_bytes("whatsapp", TenantHint::RoutingKey("pn-1".into()), &body)
            .await
            .unwrap()
            .expect("webhook published");
    }

    async fn messages(&self) -> Vec<Message> {
        let mut messages = self.memory.backend.messages().await;
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    async fn snapshot(&self) -> Snapshot {
        Snapshot {
            sent: self.memory.sender.sent().await,
            messages: self.messages().await,
            dead_lettered: self.dlq.count().await.unwrap(),
        }
    }

    /// Poll until `check` holds or five seconds pass
    async fn wait_until(&self, what: &str, check: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.snapshot().await;
            if check(&snapshot) {
                return snapshot;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        delivery: DeliveryConfig {
            inter_chunk_delay_ms: 10,
            ..Default::default()
        },
        workers: WorkerConfig {
            handler_timeout_secs: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn whatsapp_webhook(messages: serde_json::Value) -> serde_json::Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "waba-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"display_phone_number": "15550000000", "phone_number_id": "pn-1"},
                    "contacts": [{"wa_id": "15551234567", "profile": {"name": "Ana"}}],
                    "messages": messages
                }
            }]
        }]
    })
}

fn text(id: &str, body: &str) -> serde_json::Value {
    json!({"from": "15551234567", "id": id, "timestamp": "1700000000", "type": "text", "text": {"body": body}})
}

// ─── Happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn test_text_webhook_gets_reply() {
    let h = Harness::start(fast_config()).await;
    h.memory.model.push_reply("Hi Ana! We open at 9am.").await;

    h.post(json!([text("wamid.1", "When do you open?")])).await;
    let snap = h
        .wait_until("reply marked sent", |s| {
            s.outbound().any(|m| m.status == MessageStatus::Sent)
        })
        .await;

    assert_eq!(snap.sent.len(), 1);
    assert_eq!(snap.sent[0].text, "Hi Ana! We open at 9am.");
    assert_eq!(snap.sent[0].target.recipient, "15551234567");
    assert_eq!(snap.sent[0].target.reply_to.as_deref(), Some("wamid.1"));

    let messages = &snap.messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].direction, Direction::Inbound);
    assert_eq!(messages[0].sender_type, SenderType::Contact);
    assert_eq!(messages[1].sender_type, SenderType::Ai);
    assert_eq!(messages[1].in_reply_to, Some(messages[0].id));

    let contacts = h.memory.backend.contacts().await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].identifier, "15551234567");
    assert_eq!(h.memory.backend.conversations().await.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_long_reply_delivered_in_chunks() {
    let h = Harness::start(fast_config()).await;
    h.memory
        .model
        .push_reply("Thanks for asking.[BREAK]Our store opens at 9am.[BREAK]See you soon!")
        .await;

    h.post(json!([text("wamid.2", "Hours?")])).await;
    let snap = h
        .wait_until("reply marked sent", |s| {
            s.outbound().any(|m| m.status == MessageStatus::Sent)
        })
        .await;

    let texts: Vec<&str> = snap.sent.iter().map(|s| s.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["Thanks for asking.", "Our store opens at 9am.", "See you soon!"]
    );

    h.stop().await;
}

// ─── Guards & failures ───────────────────────────────────────────

#[tokio::test]
async fn test_too_long_message_gets_canned_reply() {
    let mut config = fast_config();
    config.ingest.max_inbound_word_count = 5;
    let h = Harness::start(config).await;

    h.post(json!([text("wamid.3", "one two three four five six seven")]))
        .await;
    let snap = h.wait_until("canned reply sent", |s| s.sent.len() == 1).await;
    assert_eq!(snap.sent[0].text, RelayConfig::default().ingest.too_long_reply);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.memory.model.calls().await.is_empty());
    assert!(h.messages().await.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = Harness::start(fast_config()).await;
    h.memory.backend.fail_next("contacts.create", 1).await;

    h.post(json!([text("wamid.4", "hello?")])).await;
    let snap = h.wait_until("reply sent after retry", |s| s.sent.len() == 1).await;

    assert_eq!(snap.dead_lettered, 0);
    assert_eq!(h.memory.backend.contacts().await.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let mut config = fast_config();
    config.workers.max_deliver = 2;
    let h = Harness::start(config).await;
    h.memory.model.push_error("overloaded").await;
    h.memory.model.push_error("overloaded").await;

    h.post(json!([text("wamid.5", "hello?")])).await;
    let snap = h.wait_until("event dead-lettered", |s| s.dead_lettered == 1).await;

    let dead = h.dlq.list(1).await.unwrap();
    assert_eq!(dead[0].consumer, "responder");
    assert!(dead[0].reason.contains("failed after 2 attempts"));
    assert_eq!(h.memory.model.calls().await.len(), 2);
    assert!(snap.sent.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_duplicate_webhook_is_idempotent() {
    let h = Harness::start(fast_config()).await;

    h.post(json!([text("wamid.6", "Is this thing on?")])).await;
    h.wait_until("first reply sent", |s| {
        s.outbound().any(|m| m.status == MessageStatus::Sent)
    })
    .await;

    h.post(json!([text("wamid.6", "Is this thing on?")])).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snap = h.snapshot().await;
    assert_eq!(snap.messages.len(), 2);
    assert_eq!(snap.sent.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_delivery_failure_marks_reply_failed() {
    let h = Harness::start(fast_config()).await;
    h.memory.sender.fail_after(0, "recipient unreachable").await;

    h.post(json!([text("wamid.7", "hello")])).await;
    let snap = h
        .wait_until("reply marked failed", |s| {
            s.outbound().any(|m| m.status == MessageStatus::Failed)
        })
        .await;

    let reply = snap.outbound().next().unwrap();
    assert!(reply
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("recipient unreachable"));
    assert_eq!(snap.dead_lettered, 0);

    h.stop().await;
}

// ─── Ingestion errors ────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_webhooks_rejected() {
    let h = Harness::start(fast_config()).await;
    let webhooks = h.pipeline.webhooks();

    let err = assert_err!(
        webhooks
            .handle_bytes("whatsapp", TenantHint::RoutingKey("pn-1".into()), b"{}")
            .await
    );
    assert!(matches!(err, RelayError::EmptyPayload));

    let err = assert_err!(
        webhooks
            .handle_bytes("telegram", TenantHint::RoutingKey("pn-1".into()), b"{\"a\":1}")
            .await
    );
    assert!(err.is_malformed_input());

    let published = assert_ok!(h.pipeline.bus().list_events(None, 10).await);
    assert!(published.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_unknown_routing_key_not_found() {
    let h = Harness::start(fast_config()).await;
    let body = serde_json::to_vec(&whatsapp_webhook(json!([text("wamid.8", "hi")]))).unwrap();
    let err = h
        .pipeline
        .webhooks()
        .handle_bytes("whatsapp", TenantHint::RoutingKey("pn-unknown".into()), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));

    h.stop().await;
}

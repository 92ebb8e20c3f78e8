//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

use a3s_relay::domain::{DeliveryMedium, Platform};
use a3s_relay::events::{new_event_id, MessageDelivery};
use a3s_relay::provider::nats::{NatsConfig, NatsProvider, StorageType};
use a3s_relay::services::memory::MemoryServices;
use a3s_relay::{
    Event, EventBus, EventProvider, Pipeline, PipelineEvent, PublishOptions, SubscribeOptions,
    TenantHint,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn nats_config(stream_suffix: &str) -> NatsConfig {
    NatsConfig {
        url: "nats://127.0.0.1:4222".to_string(),
        stream_name: format!("TEST_RELAY_{}", stream_suffix.to_uppercase()),
        subject_prefix: format!("test.{}", stream_suffix),
        storage: StorageType::Memory,
        max_events: 10_000,
        max_age_secs: 60,
        ..Default::default()
    }
}

/// Try to connect to NATS. Returns None if server is unavailable.
async fn try_nats_provider(stream_suffix: &str) -> Option<NatsProvider> {
    match NatsProvider::connect(nats_config(stream_suffix)).await {
        Ok(provider) => Some(provider),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Helper to create an EventBus with NATS, or skip the test
macro_rules! nats_bus {
    ($suffix:expr) => {
        match try_nats_provider($suffix).await {
            Some(p) => EventBus::new(p),
            None => return,
        }
    };
}

fn delivery() -> MessageDelivery {
    MessageDelivery {
        event_id: new_event_id(),
        message_id: Uuid::new_v4(),
        conversation_id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        contact_id: Uuid::new_v4(),
        medium: DeliveryMedium::Chat,
        channel_message_id: Some("wamid.1".into()),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_nats_publish_typed_and_history() {
    let bus = nats_bus!("pub_hist");

    let payload = delivery();
    let event = bus.publish_typed("dispatcher", &payload).await.unwrap();
    assert!(event.id.starts_with("evt-"));
    assert_eq!(event.subject, "test.pub_hist.conversation.message.delivery");
    assert_eq!(event.event_type, MessageDelivery::TOPIC);

    // Give JetStream a moment to persist
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = bus
        .list_events(Some(MessageDelivery::TOPIC), 10)
        .await
        .unwrap();
    let stored = events.iter().find(|e| e.id == event.id).unwrap();
    let decoded = MessageDelivery::from_event(stored).unwrap();
    assert_eq!(decoded.message_id, payload.message_id);
}

#[tokio::test]
async fn test_nats_publish_with_dedup() {
    let bus = nats_bus!("dedup");

    let event = Event::new(
        "test.dedup.conversation.message.delivery",
        "conversation",
        "Dedup test",
        "test",
        serde_json::json!({"key": "value"}),
    );
    let opts = PublishOptions::dedup("dedup-test-1");

    let seq1 = bus.publish_event_with_options(&event, &opts).await.unwrap();
    assert!(seq1 > 0);

    // Same msg_id inside the duplicate window returns the original sequence
    let seq2 = bus.publish_event_with_options(&event, &opts).await.unwrap();
    assert_eq!(seq1, seq2, "Duplicate message should return same sequence");
}

#[tokio::test]
async fn test_nats_durable_work_queue_manual_ack() {
    let bus = nats_bus!("manual_ack");
    let opts = SubscribeOptions {
        max_deliver: Some(3),
        ack_wait_secs: Some(5),
        ..Default::default()
    };

    let mut sub = bus
        .subscribe_durable("ack-test-consumer", MessageDelivery::TOPIC, &opts)
        .await
        .unwrap();
    let payload = delivery();
    bus.publish_typed("dispatcher", &payload).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), sub.next_manual_ack()).await;
    if let Ok(Ok(Some(pending))) = result {
        assert_eq!(pending.received.num_delivered, 1);
        let decoded = MessageDelivery::from_event(&pending.received.event).unwrap();
        assert_eq!(decoded.message_id, payload.message_id);
        pending.ack().await.unwrap();
    }

    let _ = bus.remove_consumer("ack-test-consumer").await;
}

#[tokio::test]
async fn test_nats_nak_redelivers() {
    let bus = nats_bus!("nak");
    let mut sub = bus
        .subscribe_durable("nak-consumer", MessageDelivery::TOPIC, &SubscribeOptions::default())
        .await
        .unwrap();
    bus.publish_typed("dispatcher", &delivery()).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), sub.next_manual_ack()).await;
    if let Ok(Ok(Some(pending))) = first {
        pending.nak().await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(2), sub.next_manual_ack()).await;
        if let Ok(Ok(Some(pending))) = again {
            assert_eq!(pending.received.num_delivered, 2);
            pending.ack().await.unwrap();
        }
    }

    let _ = bus.remove_consumer("nak-consumer").await;
}

#[tokio::test]
async fn test_nats_provider_info() {
    let bus = nats_bus!("info");
    bus.publish_typed("dispatcher", &delivery()).await.unwrap();

    let info = bus.info().await.unwrap();
    assert_eq!(info.provider, "nats");
    assert!(info.messages >= 1);
}

#[tokio::test]
async fn test_nats_concurrent_publish() {
    let bus = Arc::new(nats_bus!("concurrent"));
    let mut handles = Vec::new();

    for _ in 0..20 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            bus.publish_typed("dispatcher", &delivery()).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = bus.list_events(None, 100).await.unwrap();
    assert_eq!(events.len(), 20);
}

#[tokio::test]
async fn test_nats_pipeline_end_to_end() {
    let provider = match try_nats_provider("e2e").await {
        Some(p) => p,
        None => return,
    };
    assert_eq!(provider.name(), "nats");

    let memory = MemoryServices::new();
    memory
        .backend
        .add_route(Platform::Facebook, "page-1", Uuid::new_v4())
        .await;
    memory.model.push_reply("Hello from the relay").await;

    let pipeline = Pipeline::builder(Arc::new(provider), memory.services())
        .build()
        .unwrap();
    pipeline.ensure_consumers().await.unwrap();
    let shutdown = CancellationToken::new();
    let handles = pipeline.start(shutdown.clone());

    let body = serde_json::json!({
        "object": "page",
        "entry": [{
            "id": "page-1",
            "time": 1700000000000u64,
            "messaging": [{
                "sender": {"id": "psid-1"},
                "recipient": {"id": "page-1"},
                "timestamp": 1700000000000u64,
                "message": {"mid": "m_1", "text": "hi"}
            }]
        }]
    });
    pipeline
        .webhooks()
        .handle("facebook", TenantHint::RoutingKey("page-1".into()), body)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while memory.sender.sent().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let sent = memory.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "Hello from the relay");
    assert_eq!(sent[0].target.recipient, "psid-1");

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

//! Contact memory document and its periodic refresh
//!
//! The memory is stored on the contact as free-form JSON. Known sections
//! are typed; anything else survives a round trip through `extra`.

use crate::analysis::{ConversationAnalyzer, ConversationInsights};
use crate::cache::ContextCache;
use crate::config::ContactMemoryConfig;
use crate::context::truncate_chars;
use crate::domain::Sentiment;
use crate::error::Result;
use crate::services::{ContactService, MessageService};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Extra = serde_json::Map<String, serde_json::Value>;

/// Typed view of a contact's memory document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMemory {
    #[serde(default, alias = "customer_profile", skip_serializing_if = "Option::is_none")]
    pub customer_profile: Option<CustomerProfile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryFacts>,

    #[serde(default, alias = "active_topic", skip_serializing_if = "Option::is_none")]
    pub active_topic: Option<String>,

    #[serde(default, alias = "session_summary", skip_serializing_if = "Option::is_none")]
    pub session_summary: Option<SessionSummary>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFacts {
    #[serde(default, alias = "important_facts")]
    pub important_facts: Vec<String>,
    #[serde(default, alias = "previous_issues")]
    pub previous_issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default, alias = "needs_human")]
    pub needs_human: bool,
    #[serde(default, alias = "last_open_question", skip_serializing_if = "Option::is_none")]
    pub last_open_question: Option<String>,
    #[serde(default, alias = "message_count")]
    pub message_count: u64,
    #[serde(default, alias = "updated_at", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContactMemory {
    /// Decode tolerantly: missing or malformed sections become empty
    pub fn from_document(document: &serde_json::Value) -> Self {
        let Some(object) = document.as_object() else {
            return Self::default();
        };
        if let Ok(memory) = serde_json::from_value::<Self>(document.clone()) {
            return memory;
        }

        fn section<T: DeserializeOwned>(object: &Extra, keys: &[&str]) -> Option<T> {
            keys.iter()
                .filter_map(|k| object.get(*k))
                .find_map(|v| serde_json::from_value(v.clone()).ok())
        }

        tracing::debug!("Contact memory partially malformed, keeping decodable sections");
        let known = [
            "customerProfile",
            "customer_profile",
            "memory",
            "activeTopic",
            "active_topic",
            "sessionSummary",
            "session_summary",
        ];
        Self {
            customer_profile: section(object, &["customerProfile", "customer_profile"]),
            memory: section(object, &["memory"]),
            active_topic: section(object, &["activeTopic", "active_topic"]),
            session_summary: section(object, &["sessionSummary", "session_summary"]),
            extra: object
                .iter()
                .filter(|(k, _)| !known.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Fold fresh insights into the document
    pub fn apply(&mut self, insights: ConversationInsights, message_count: u64, at: DateTime<Utc>) {
        if insights.active_topic.is_some() {
            self.active_topic = insights.active_topic;
        }
        self.session_summary = Some(SessionSummary {
            narrative: insights.narrative,
            sentiment: insights.sentiment,
            needs_human: insights.needs_human,
            last_open_question: insights.last_open_question,
            message_count,
            updated_at: Some(at),
        });
    }

    /// Labeled text block for the prompt, at most `max_chars` characters
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = String::new();

        if let Some(ref profile) = self.customer_profile {
            let mut lines = Vec::new();
            if let Some(ref name) = profile.name {
                lines.push(format!("- Name: {}", name));
            }
            if let Some(ref language) = profile.language {
                lines.push(format!("- Language: {}", language));
            }
            if !profile.preferences.is_empty() {
                lines.push(format!("- Preferences: {}", profile.preferences.join(", ")));
            }
            for (key, value) in &profile.extra {
                if let Some(text) = scalar_text(value) {
                    lines.push(format!("- {}: {}", key, text));
                }
            }
            if !lines.is_empty() {
                let _ = writeln!(out, "Customer profile:\n{}", lines.join("\n"));
            }
        }

        if let Some(ref facts) = self.memory {
            if !facts.important_facts.is_empty() {
                let _ = writeln!(out, "Important facts:");
                for fact in &facts.important_facts {
                    let _ = writeln!(out, "- {}", fact);
                }
            }
            if !facts.previous_issues.is_empty() {
                let _ = writeln!(out, "Previous issues:");
                for issue in &facts.previous_issues {
                    let _ = writeln!(out, "- {}", issue);
                }
            }
        }

        if let Some(ref topic) = self.active_topic {
            let _ = writeln!(out, "Active topic: {}", topic);
        }

        if let Some(ref summary) = self.session_summary {
            if !summary.narrative.is_empty() {
                let _ = writeln!(
                    out,
                    "Last session: {} (sentiment: {}{})",
                    summary.narrative,
                    summary.sentiment,
                    if summary.needs_human { ", wants a human" } else { "" }
                );
            }
            if let Some(ref question) = summary.last_open_question {
                let _ = writeln!(out, "Open question: {}", question);
            }
        }

        truncate_chars(out.trim_end(), max_chars)
    }
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Refresh every `threshold` messages
pub fn should_update(message_count: u64, threshold: u64) -> bool {
    threshold > 0 && message_count >= threshold && message_count % threshold == 0
}

/// Refreshes contact memory from recent conversation activity
pub struct MemoryUpdater {
    contacts: Arc<dyn ContactService>,
    messages: Arc<dyn MessageService>,
    analyzer: Arc<dyn ConversationAnalyzer>,
    contexts: Arc<ContextCache>,
    config: ContactMemoryConfig,
}

impl MemoryUpdater {
    pub fn new(
        contacts: Arc<dyn ContactService>,
        messages: Arc<dyn MessageService>,
        analyzer: Arc<dyn ConversationAnalyzer>,
        contexts: Arc<ContextCache>,
        config: ContactMemoryConfig,
    ) -> Self {
        Self {
            contacts,
            messages,
            analyzer,
            contexts,
            config,
        }
    }

    /// Run [`MemoryUpdater::update`] on its own task under its own deadline
    ///
    /// The task is not tied to the caller's cancellation; its outcome is
    /// only logged.
    pub fn spawn(self: &Arc<Self>, contact_id: Uuid, conversation_id: Uuid) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let timeout = self.config.timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, this.update(contact_id, conversation_id)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => tracing::trace!(
                    contact_id = %contact_id,
                    conversation_id = %conversation_id,
                    "Contact memory not due"
                ),
                Ok(Err(e)) => tracing::warn!(
                    contact_id = %contact_id,
                    conversation_id = %conversation_id,
                    error = %e,
                    "Contact memory update failed"
                ),
                Err(_) => tracing::warn!(
                    contact_id = %contact_id,
                    conversation_id = %conversation_id,
                    timeout_secs = timeout.as_secs(),
                    "Contact memory update timed out"
                ),
            }
        })
    }

    /// Refresh the memory if the conversation reached a threshold multiple
    ///
    /// Returns whether the memory was rewritten.
    pub async fn update(&self, contact_id: Uuid, conversation_id: Uuid) -> Result<bool> {
        let count = self.messages.count(conversation_id).await?;
        if !should_update(count, self.config.message_threshold) {
            return Ok(false);
        }

        let recent = self
            .messages
            .list_recent(conversation_id, self.config.summary_window)
            .await?;
        let contact = self.contacts.get(contact_id).await?;
        let insights = self.analyzer.analyze(&recent).await;

        let mut memory = ContactMemory::from_document(&contact.memory);
        let sentiment = insights.sentiment;
        let needs_human = insights.needs_human;
        memory.apply(insights, count, Utc::now());
        self.contacts
            .update_memory(contact_id, memory.to_document())
            .await?;
        self.contexts.invalidate(contact_id, conversation_id).await;

        tracing::info!(
            contact_id = %contact_id,
            conversation_id = %conversation_id,
            message_count = count,
            sentiment = %sentiment,
            needs_human,
            "Contact memory updated"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::KeywordAnalyzer;
    use crate::cache::CachedContext;
    use crate::domain::{
        Direction, MessageKind, MessageStatus, NewContact, NewMessage, Platform, SenderType,
    };
    use crate::services::memory::MemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_should_update_threshold() {
        let fires: Vec<u64> = (0..=20).filter(|&n| should_update(n, 5)).collect();
        assert_eq!(fires, vec![5, 10, 15, 20]);
        assert!(!should_update(4, 5));
        assert!(!should_update(0, 5));
        assert!(!should_update(5, 0));
    }

    #[test]
    fn test_missing_or_malformed_memory_is_empty() {
        assert_eq!(ContactMemory::from_document(&json!(null)), ContactMemory::default());
        assert_eq!(ContactMemory::from_document(&json!("text")), ContactMemory::default());
        assert_eq!(ContactMemory::default().render(500), "");
    }

    #[test]
    fn test_partial_document_keeps_good_sections() {
        let doc = json!({
            "customer_profile": {"name": "Ana", "tier": "gold"},
            "memory": "not an object",
            "sessionSummary": {"narrative": "asked about refunds", "sentiment": "negative", "needsHuman": true},
            "loyaltyId": 42
        });

        let memory = ContactMemory::from_document(&doc);
        assert_eq!(memory.customer_profile.as_ref().unwrap().name.as_deref(), Some("Ana"));
        assert!(memory.memory.is_none());
        assert!(memory.session_summary.as_ref().unwrap().needs_human);
        assert_eq!(memory.extra["loyaltyId"], 42);

        let block = memory.render(1000);
        assert!(block.contains("- Name: Ana"));
        assert!(block.contains("- tier: gold"));
        assert!(block.contains("sentiment: negative, wants a human"));
    }

    #[test]
    fn test_render_is_bounded() {
        let memory = ContactMemory {
            memory: Some(MemoryFacts {
                important_facts: (0..100).map(|i| format!("fact number {}", i)).collect(),
                previous_issues: vec![],
            }),
            ..Default::default()
        };
        assert!(memory.render(120).chars().count() <= 120);
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let doc = json!({"activeTopic": "billing", "crmId": "c-1"});
        let memory = ContactMemory::from_document(&doc);
        assert_eq!(memory.to_document(), doc);
    }

    async fn seeded(count: usize) -> (MemoryBackend, Uuid, Uuid) {
        let backend = MemoryBackend::new();
        let contact = ContactService::create(
            &backend,
            NewContact {
                organization_id: Uuid::nil(),
                platform: Platform::WhatsApp,
                identifier: "1".into(),
                name: "1".into(),
            },
        )
        .await
        .unwrap();
        let conversation = Uuid::new_v4();
        for i in 0..count {
            MessageService::create(
                &backend,
                NewMessage {
                    organization_id: Uuid::nil(),
                    conversation_id: conversation,
                    contact_id: contact.id,
                    direction: Direction::Inbound,
                    sender_type: SenderType::Contact,
                    kind: MessageKind::Text,
                    content: if i + 1 == count {
                        "Can I talk to a human?".into()
                    } else {
                        format!("message {}", i)
                    },
                    media_url: None,
                    channel_message_id: None,
                    in_reply_to: None,
                    status: MessageStatus::Delivered,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        }
        (backend, contact.id, conversation)
    }

    fn updater(backend: &MemoryBackend, contexts: Arc<ContextCache>) -> Arc<MemoryUpdater> {
        Arc::new(MemoryUpdater::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(KeywordAnalyzer::default()),
            contexts,
            ContactMemoryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_update_fires_on_threshold_and_invalidates_context() {
        let (backend, contact, conversation) = seeded(5).await;
        let contexts = Arc::new(ContextCache::new(Duration::from_secs(60)));
        contexts
            .insert(
                contact,
                conversation,
                CachedContext {
                    organization_id: Uuid::nil(),
                    organization_prompt: String::new(),
                    contact_context: String::new(),
                    conversation_history: String::new(),
                    full_context: String::new(),
                    message_count_at_cache_time: 5,
                    cached_at: tokio::time::Instant::now(),
                },
            )
            .await;

        let updater = updater(&backend, contexts.clone());
        updater.spawn(contact, conversation).await.unwrap();

        let stored = ContactService::get(&backend, contact).await.unwrap();
        let memory = ContactMemory::from_document(&stored.memory);
        let summary = memory.session_summary.unwrap();
        assert!(summary.needs_human);
        assert_eq!(summary.message_count, 5);
        assert_eq!(summary.last_open_question.as_deref(), Some("Can I talk to a human?"));
        assert!(contexts.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_skipped_off_threshold() {
        let (backend, contact, conversation) = seeded(6).await;
        let updater = updater(&backend, Arc::new(ContextCache::new(Duration::from_secs(60))));
        assert!(!updater.update(contact, conversation).await.unwrap());
        assert_eq!(backend.calls("contacts.update_memory").await, 0);
    }
}

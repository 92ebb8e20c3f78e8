//! Process-local context caches
//!
//! Two read-through tiers, each behind one reader/writer lock:
//! organization prompts (TTL only) and per-conversation contexts (TTL and
//! unchanged message count).

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// Organization prompt with its knowledge digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPrompt {
    pub system_prompt: String,
    pub knowledge_digest: String,
    /// `system_prompt + "\n\n" + knowledge_digest`
    pub full_prompt: String,
    /// Organization model override
    pub ai_model: Option<String>,
    pub cached_at: Instant,
}

impl CachedPrompt {
    pub fn new(system_prompt: String, knowledge_digest: String) -> Self {
        let full_prompt = format!("{}\n\n{}", system_prompt, knowledge_digest);
        Self {
            system_prompt,
            knowledge_digest,
            full_prompt,
            ai_model: None,
            cached_at: Instant::now(),
        }
    }

    pub fn with_model(mut self, ai_model: Option<String>) -> Self {
        self.ai_model = ai_model;
        self
    }
}

/// Organization prompts keyed by organization id
pub struct PromptCache {
    entries: RwLock<HashMap<Uuid, CachedPrompt>>,
    ttl: Duration,
}

impl PromptCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Entry if younger than the TTL
    pub async fn get(&self, organization_id: Uuid) -> Option<CachedPrompt> {
        let entries = self.entries.read().await;
        entries
            .get(&organization_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .cloned()
    }

    pub async fn insert(&self, organization_id: Uuid, prompt: CachedPrompt) {
        self.entries.write().await.insert(organization_id, prompt);
    }

    /// Drop after a settings or knowledge change
    pub async fn invalidate(&self, organization_id: Uuid) -> bool {
        self.entries.write().await.remove(&organization_id).is_some()
    }

    /// Remove expired entries, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Assembled context for one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContext {
    pub organization_id: Uuid,
    pub organization_prompt: String,
    pub contact_context: String,
    pub conversation_history: String,
    pub full_context: String,
    pub message_count_at_cache_time: u64,
    pub cached_at: Instant,
}

type ContextKey = (Uuid, Uuid);

/// Contexts keyed by (contact id, conversation id)
pub struct ContextCache {
    entries: RwLock<HashMap<ContextKey, CachedContext>>,
    ttl: Duration,
}

impl ContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Entry if younger than the TTL and built at the current message count
    pub async fn get(
        &self,
        contact_id: Uuid,
        conversation_id: Uuid,
        current_message_count: u64,
    ) -> Option<CachedContext> {
        let entries = self.entries.read().await;
        entries
            .get(&(contact_id, conversation_id))
            .filter(|entry| {
                entry.cached_at.elapsed() < self.ttl
                    && entry.message_count_at_cache_time == current_message_count
            })
            .cloned()
    }

    pub async fn insert(&self, contact_id: Uuid, conversation_id: Uuid, context: CachedContext) {
        self.entries
            .write()
            .await
            .insert((contact_id, conversation_id), context);
    }

    /// Drop one conversation's entry
    pub async fn invalidate(&self, contact_id: Uuid, conversation_id: Uuid) -> bool {
        self.entries
            .write()
            .await
            .remove(&(contact_id, conversation_id))
            .is_some()
    }

    /// Drop every entry of a contact
    pub async fn invalidate_contact(&self, contact_id: Uuid) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(contact, _), _| *contact != contact_id);
        before - entries.len()
    }

    /// Drop every entry built for an organization
    pub async fn invalidate_organization(&self, organization_id: Uuid) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.organization_id != organization_id);
        before - entries.len()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

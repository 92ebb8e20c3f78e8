//! Context assembly for AI replies
//!
//! Builds the grounding text in priority order: organization prompt,
//! contact memory, recent history, then the instruction marker. Both the
//! organization prompt and the assembled result are read through the
//! caches in [`crate::cache`].

use crate::cache::{CachedContext, CachedPrompt, ContextCache, PromptCache};
use crate::config::ContextConfig;
use crate::contact_memory::ContactMemory;
use crate::domain::{KnowledgeEntry, Message};
use crate::error::Result;
use crate::services::{ContactService, MessageService, OrganizationService};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Separates grounding context from the live customer message
pub const INSTRUCTION_MARKER: &str =
    "--- End of context. Reply to the customer's current message below. ---";

/// Character-bounded prefix, with an ellipsis when cut
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push('…');
    out
}

/// Which conversation a context is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextKey {
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub conversation_id: Uuid,
    /// The message being answered, left out of the history block
    pub trigger_message_id: Uuid,
}

/// Read-through context builder shared by every responder loop
pub struct ContextAssembler {
    organizations: Arc<dyn OrganizationService>,
    contacts: Arc<dyn ContactService>,
    messages: Arc<dyn MessageService>,
    prompts: PromptCache,
    contexts: Arc<ContextCache>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(
        organizations: Arc<dyn OrganizationService>,
        contacts: Arc<dyn ContactService>,
        messages: Arc<dyn MessageService>,
        config: ContextConfig,
    ) -> Self {
        Self {
            organizations,
            contacts,
            messages,
            prompts: PromptCache::new(config.prompt_ttl()),
            contexts: Arc::new(ContextCache::new(config.context_ttl())),
            config,
        }
    }

    /// The per-conversation cache, shared with the memory updater
    pub fn contexts(&self) -> Arc<ContextCache> {
        Arc::clone(&self.contexts)
    }

    /// Full context for one reply
    pub async fn assemble(&self, key: ContextKey) -> Result<String> {
        let message_count = self.messages.count(key.conversation_id).await?;
        if let Some(hit) = self
            .contexts
            .get(key.contact_id, key.conversation_id, message_count)
            .await
        {
            tracing::debug!(
                conversation_id = %key.conversation_id,
                message_count,
                "Context cache hit"
            );
            return Ok(hit.full_context);
        }

        let prompt = self.organization_prompt(key.organization_id).await?;
        let contact_context = self.contact_context(key.contact_id).await?;
        let conversation_history = self.history(key.conversation_id, key.trigger_message_id).await?;

        let mut sections = vec![prompt.full_prompt.clone()];
        if !contact_context.is_empty() {
            sections.push(format!("Customer information:\n{}", contact_context));
        }
        if !conversation_history.is_empty() {
            sections.push(format!("Conversation history:\n{}", conversation_history));
        }
        sections.push(INSTRUCTION_MARKER.to_string());
        let full_context = sections.join("\n\n");

        self.contexts
            .insert(
                key.contact_id,
                key.conversation_id,
                CachedContext {
                    organization_id: key.organization_id,
                    organization_prompt: prompt.full_prompt,
                    contact_context,
                    conversation_history,
                    full_context: full_context.clone(),
                    message_count_at_cache_time: message_count,
                    cached_at: Instant::now(),
                },
            )
            .await;

        tracing::debug!(
            conversation_id = %key.conversation_id,
            message_count,
            context_chars = full_context.len(),
            "Context assembled"
        );
        Ok(full_context)
    }

    /// Organization prompt, read through the prompt cache
    pub async fn organization_prompt(&self, organization_id: Uuid) -> Result<CachedPrompt> {
        if let Some(hit) = self.prompts.get(organization_id).await {
            return Ok(hit);
        }

        let settings = self.organizations.settings(organization_id).await?;
        let knowledge = self.organizations.knowledge(organization_id).await?;
        let system_prompt = settings
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.default_system_prompt.clone());

        let prompt = CachedPrompt::new(system_prompt, knowledge_digest(&knowledge))
            .with_model(settings.ai_model.filter(|m| !m.trim().is_empty()));
        self.prompts.insert(organization_id, prompt.clone()).await;
        tracing::debug!(
            organization_id = %organization_id,
            knowledge_entries = knowledge.len(),
            "Organization prompt loaded"
        );
        Ok(prompt)
    }

    async fn contact_context(&self, contact_id: Uuid) -> Result<String> {
        let contact = self.contacts.get(contact_id).await?;
        Ok(ContactMemory::from_document(&contact.memory).render(self.config.contact_block_max_chars))
    }

    async fn history(&self, conversation_id: Uuid, trigger_message_id: Uuid) -> Result<String> {
        let window = self.config.history_window;
        let recent = self
            .messages
            .list_recent(conversation_id, window + 1)
            .await?;
        let kept: Vec<&Message> = recent
            .iter()
            .filter(|m| m.id != trigger_message_id)
            .collect();
        let skip = kept.len().saturating_sub(window);

        Ok(kept
            .into_iter()
            .skip(skip)
            .map(|m| history_line(m, self.config.history_truncate_chars))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Drop the organization prompt and every context built on it
    pub async fn invalidate_organization(&self, organization_id: Uuid) {
        let prompt = self.prompts.invalidate(organization_id).await;
        let contexts = self.contexts.invalidate_organization(organization_id).await;
        tracing::info!(
            organization_id = %organization_id,
            prompt,
            contexts,
            "Organization context invalidated"
        );
    }

    /// Drop every context of a contact
    pub async fn invalidate_contact(&self, contact_id: Uuid) {
        let contexts = self.contexts.invalidate_contact(contact_id).await;
        tracing::debug!(contact_id = %contact_id, contexts, "Contact context invalidated");
    }

    /// Remove expired entries from both tiers
    pub async fn purge_expired(&self) -> usize {
        self.prompts.purge_expired().await + self.contexts.purge_expired().await
    }
}

fn knowledge_digest(entries: &[KnowledgeEntry]) -> String {
    if entries.is_empty() {
        return "No organization knowledge is available.".to_string();
    }
    let body = entries
        .iter()
        .map(|entry| format!("## {}\n{}", entry.title.trim(), entry.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Organization knowledge:\n\n{}", body)
}

/// `[timestamp] Role: "content"`
fn history_line(message: &Message, max_chars: usize) -> String {
    let content = if message.content.trim().is_empty() {
        format!("[{:?}]", message.kind).to_lowercase()
    } else {
        truncate_chars(message.content.trim(), max_chars)
    };
    format!(
        "[{}] {}: \"{}\"",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.sender_type.role_label(),
        content
    )
}

//! Pipeline configuration
//!
//! Every field has a default so a partial JSON document is a valid config.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub ingest: IngestConfig,
    pub context: ContextConfig,
    pub contact_memory: ContactMemoryConfig,
    pub analysis: AnalysisConfig,
    pub delivery: DeliveryConfig,
    pub workers: WorkerConfig,
}

impl RelayConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RelayError::Config(format!("Invalid relay config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Reject values the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(RelayError::Config(format!("{} must be greater than 0", name)));
            }
            Ok(())
        }

        positive("ingest.maxInboundWordCount", self.ingest.max_inbound_word_count as u64)?;
        positive("context.historyWindow", self.context.history_window as u64)?;
        positive("context.promptTtlSecs", self.context.prompt_ttl_secs)?;
        positive("context.contextTtlSecs", self.context.context_ttl_secs)?;
        positive("context.purgeIntervalSecs", self.context.purge_interval_secs)?;
        positive("contactMemory.messageThreshold", self.contact_memory.message_threshold)?;
        positive("contactMemory.timeoutSecs", self.contact_memory.timeout_secs)?;
        positive("delivery.maxChunkLength", self.delivery.max_chunk_length as u64)?;
        positive("delivery.maxChunksPerResponse", self.delivery.max_chunks_per_response as u64)?;
        positive("workers.handlerTimeoutSecs", self.workers.handler_timeout_secs)?;
        positive("workers.concurrency", self.workers.concurrency as u64)?;

        if self.delivery.enable_multi_message && self.delivery.chunk_separator.trim().is_empty() {
            return Err(RelayError::Config(
                "delivery.chunkSeparator cannot be blank when multi-message delivery is enabled"
                    .to_string(),
            ));
        }
        if self.ingest.too_long_reply.trim().is_empty() {
            return Err(RelayError::Config(
                "ingest.tooLongReply cannot be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalization-stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    /// Inbound messages with more words are answered with `too_long_reply`
    pub max_inbound_word_count: usize,

    /// Canned reply for over-long messages
    pub too_long_reply: String,

    /// Bound on the detached media download + upload
    pub media_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_inbound_word_count: 500,
            too_long_reply: "Your message is too long for us to process. Please shorten it and \
                             send it again."
                .to_string(),
            media_timeout_secs: 30,
        }
    }
}

impl IngestConfig {
    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }
}

/// Context assembly and caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Organization prompt cache TTL
    pub prompt_ttl_secs: u64,

    /// Per-conversation context cache TTL
    pub context_ttl_secs: u64,

    /// Recent messages included in the history block
    pub history_window: usize,

    /// Per-message character limit in the history block
    pub history_truncate_chars: usize,

    /// Character limit of the rendered contact block
    pub contact_block_max_chars: usize,

    /// Used when the organization has no system prompt override
    pub default_system_prompt: String,

    /// How often expired cache entries are swept
    pub purge_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            prompt_ttl_secs: 15 * 60,
            context_ttl_secs: 15 * 60,
            history_window: 10,
            history_truncate_chars: 500,
            contact_block_max_chars: 2000,
            default_system_prompt: "You are a helpful customer support assistant. Answer \
                                    concisely using only the organization knowledge provided. \
                                    If you do not know the answer, say so and offer to connect \
                                    the customer with a human agent."
                .to_string(),
            purge_interval_secs: 5 * 60,
        }
    }
}

impl ContextConfig {
    pub fn prompt_ttl(&self) -> Duration {
        Duration::from_secs(self.prompt_ttl_secs)
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Contact memory refresh policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactMemoryConfig {
    /// Refresh every N messages in a conversation
    pub message_threshold: u64,

    /// Deadline of the detached refresh task
    pub timeout_secs: u64,

    /// Messages considered when summarizing
    pub summary_window: usize,
}

impl Default for ContactMemoryConfig {
    fn default() -> Self {
        Self {
            message_threshold: 5,
            timeout_secs: 30,
            summary_window: 20,
        }
    }
}

impl ContactMemoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Keyword lists for [`crate::analysis::KeywordAnalyzer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisConfig {
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    pub escalation_keywords: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        Self {
            positive_keywords: words(&[
                "thanks", "thank you", "great", "awesome", "perfect", "excellent", "love",
                "happy", "helpful",
            ]),
            negative_keywords: words(&[
                "bad", "terrible", "awful", "angry", "disappointed", "frustrated", "worst",
                "broken", "useless", "refund",
            ]),
            escalation_keywords: words(&["human", "manager", "complaint"]),
        }
    }
}

/// Outbound delivery pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    /// Split long replies into several messages
    pub enable_multi_message: bool,

    pub max_chunk_length: usize,

    pub max_chunks_per_response: usize,

    /// Pause before each chunk
    pub inter_chunk_delay_ms: u64,

    /// Explicit split marker the model may emit
    pub chunk_separator: String,

    pub enable_typing_indicator: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enable_multi_message: true,
            max_chunk_length: 300,
            max_chunks_per_response: 5,
            inter_chunk_delay_ms: 1500,
            chunk_separator: "[BREAK]".to_string(),
            enable_typing_indicator: true,
        }
    }
}

impl DeliveryConfig {
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

/// Subscription loop settings shared by every worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Total time one event may take
    pub handler_timeout_secs: u64,

    /// Time a handler gets to wind down after its deadline fires
    pub cancel_grace_secs: u64,

    /// Subscription loops per worker, all on the same durable consumer
    pub concurrency: usize,

    /// Deliveries before an event is dead-lettered (0 = unlimited)
    pub max_deliver: u64,

    /// Server-side redelivery backoff (JetStream)
    pub backoff_secs: Vec<u64>,

    /// Cap of the reconnect backoff after subscription failures
    pub reconnect_backoff_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 120,
            cancel_grace_secs: 5,
            concurrency: 1,
            max_deliver: 5,
            backoff_secs: vec![1, 5, 15, 30],
            reconnect_backoff_cap_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

//! NATS JetStream provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persist to disk
    #[default]
    File,
    /// Keep in server memory
    Memory,
}

/// Connection and stream settings for the NATS provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream holding all pipeline subjects
    pub stream_name: String,

    /// Subject prefix; the stream captures `<prefix>.>`
    pub subject_prefix: String,

    /// Storage backend
    pub storage: StorageType,

    /// Maximum messages retained (-1 = unlimited)
    pub max_events: i64,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Connection timeout
    pub connect_timeout_secs: u64,

    /// Request timeout, also bounds history fetches
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: "RELAY_EVENTS".to_string(),
            subject_prefix: "events".to_string(),
            storage: StorageType::File,
            max_events: 1_000_000,
            max_age_secs: 7 * 24 * 3600,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NatsConfig {
    /// `<prefix>.<category>.<topic>`
    pub fn build_subject(&self, category: &str, topic: &str) -> String {
        format!("{}.{}.{}", self.subject_prefix, category, topic)
    }

    /// `<prefix>.<category>.>`
    pub fn category_subject(&self, category: &str) -> String {
        format!("{}.{}.>", self.subject_prefix, category)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }
}

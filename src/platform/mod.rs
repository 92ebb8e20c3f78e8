//! Platform message processors
//!
//! One pure parser per source platform turns a raw webhook payload into
//! [`WebhookMessage`] descriptors. Parsing is tolerant: every nested
//! fragment is decoded on its own and a fragment that fails is skipped
//! while its siblings proceed.

mod email;
mod facebook;
mod instagram;
mod messaging;
mod whatsapp;

pub use email::EmailProcessor;
pub use facebook::FacebookProcessor;
pub use instagram::InstagramProcessor;
pub use whatsapp::WhatsAppProcessor;

use crate::domain::{MessageKind, Platform};
use crate::error::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Normalized inbound message extracted from a webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    /// Channel address of the sender
    pub sender_identifier: String,

    /// Text content (caption for media)
    pub content: String,

    /// Provider media reference (media id or URL), resolved after persistence
    #[serde(default)]
    pub media_reference: Option<String>,

    #[serde(default)]
    pub message_kind: MessageKind,

    /// Provider-side message id
    #[serde(default)]
    pub origin_message_id: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WebhookMessage {
    /// Plain text message
    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_identifier: sender.into(),
            content: content.into(),
            media_reference: None,
            message_kind: MessageKind::Text,
            origin_message_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set kind and media reference
    pub fn with_media(mut self, kind: MessageKind, reference: impl Into<String>) -> Self {
        self.message_kind = kind;
        self.media_reference = Some(reference.into());
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.message_kind = kind;
        self
    }

    pub fn with_origin_id(mut self, id: impl Into<String>) -> Self {
        self.origin_message_id = Some(id.into());
        self
    }

    /// Add a metadata entry; `None` values are not stored
    pub fn with_metadata(
        mut self,
        key: &str,
        value: Option<impl Into<serde_json::Value>>,
    ) -> Self {
        if let Some(value) = value {
            self.metadata.insert(key.to_string(), value.into());
        }
        self
    }

    /// Display name reported by the platform
    pub fn sender_name(&self) -> Option<&str> {
        self.metadata.get("senderName").and_then(|v| v.as_str())
    }

    /// Whitespace-separated word count
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

/// Parser for one source platform
pub trait PlatformProcessor: Send + Sync {
    /// Platform handled by this processor
    fn platform(&self) -> Platform;

    /// Numeric channel id
    fn channel_id(&self) -> i32 {
        self.platform().channel_id()
    }

    /// Check the payload's top-level shape
    fn validate_payload(&self, raw: &serde_json::Value) -> Result<()>;

    /// Extract every decodable message
    fn extract_messages(&self, raw: &serde_json::Value) -> Result<Vec<WebhookMessage>>;
}

/// Processors keyed by platform name
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn PlatformProcessor>>,
}

impl ProcessorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in processors
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WhatsAppProcessor));
        registry.register(Arc::new(InstagramProcessor));
        registry.register(Arc::new(FacebookProcessor));
        registry.register(Arc::new(EmailProcessor));
        registry
    }

    /// Add or replace the processor for its platform
    pub fn register(&mut self, processor: Arc<dyn PlatformProcessor>) {
        self.processors
            .insert(processor.platform().as_str().to_string(), processor);
    }

    /// Look up by platform name (case-insensitive)
    pub fn get(&self, platform: &str) -> Result<Arc<dyn PlatformProcessor>> {
        self.processors
            .get(&platform.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RelayError::UnsupportedPlatform(platform.to_string()))
    }

    /// Registered platform names, sorted
    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Decode each fragment independently, skipping the ones that fail
pub(crate) fn decode_each<T: DeserializeOwned>(
    fragments: &[serde_json::Value],
    what: &'static str,
) -> Vec<T> {
    fragments
        .iter()
        .enumerate()
        .filter_map(|(index, fragment)| {
            match serde_json::from_value::<T>(fragment.clone()) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    tracing::warn!(fragment = what, index, error = %e, "Skipping undecodable fragment");
                    None
                }
            }
        })
        .collect()
}

/// Decode the top-level envelope, mapping failures to `InvalidPayload`
pub(crate) fn decode_envelope<T: DeserializeOwned>(
    raw: &serde_json::Value,
    platform: Platform,
) -> Result<T> {
    if !raw.is_object() {
        return Err(RelayError::InvalidPayload(format!(
            "{} payload must be a JSON object",
            platform
        )));
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| RelayError::InvalidPayload(format!("{} payload: {}", platform, e)))
}

/// Kind implied by a MIME type
pub(crate) fn kind_from_mime(mime: Option<&str>) -> MessageKind {
    match mime.and_then(|m| m.split('/').next()) {
        Some("image") => MessageKind::Image,
        Some("video") => MessageKind::Video,
        Some("audio") => MessageKind::Audio,
        _ => MessageKind::Document,
    }
}

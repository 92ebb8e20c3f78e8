//! Error types for a3s-relay

use thiserror::Error;

/// Errors that can occur anywhere in the relay pipeline
#[derive(Debug, Error)]
pub enum RelayError {
    /// Provider connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Provider-specific backend error (JetStream, etc.)
    #[error("Provider error: {0}")]
    Backend(String),

    /// Publish failure
    #[error("Failed to publish event to subject '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe { subject: String, reason: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream/topic creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer/subscription creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Schema validation failure
    #[error("Schema validation failed for event type '{event_type}' v{version}: {reason}")]
    SchemaValidation {
        event_type: String,
        version: u32,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Webhook body was empty or an empty JSON object
    #[error("Webhook payload is empty")]
    EmptyPayload,

    /// Webhook body could not be decoded or failed platform validation
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// No processor is registered for the platform
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity creation hit a uniqueness constraint
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Collaborator service failure (persistence, settings, etc.)
    #[error("Service error: {0}")]
    Service(String),

    /// Language model call failed
    #[error("Model error: {0}")]
    Model(String),

    /// Media download or re-hosting failed
    #[error("Media error: {0}")]
    Media(String),

    /// Outbound channel send failed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Operation exists in the interface but has no implementation for this variant
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Work was aborted through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    /// Whether the error was caused by the input itself.
    ///
    /// Malformed input is rejected synchronously and must never be retried.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            RelayError::EmptyPayload
                | RelayError::InvalidPayload(_)
                | RelayError::UnsupportedPlatform(_)
                | RelayError::Serialization(_)
                | RelayError::SchemaValidation { .. }
        )
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

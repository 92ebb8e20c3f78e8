//! Facebook Messenger webhook parser

use super::{messaging, PlatformProcessor, WebhookMessage};
use crate::domain::Platform;
use crate::error::Result;

/// Parser for `object = "page"` webhooks
#[derive(Debug, Clone, Copy, Default)]
pub struct FacebookProcessor;

impl PlatformProcessor for FacebookProcessor {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn validate_payload(&self, raw: &serde_json::Value) -> Result<()> {
        messaging::validate(raw, Platform::Facebook, "page")
    }

    fn extract_messages(&self, raw: &serde_json::Value) -> Result<Vec<WebhookMessage>> {
        messaging::extract(raw, Platform::Facebook, true)
    }
}

//! Meta Graph API client
//!
//! Outbound text and typing indicators for WhatsApp Cloud, Messenger and
//! Instagram, plus media download for inbound attachments.

use crate::domain::Platform;
use crate::error::{RelayError, Result};
use crate::services::{ChannelSender, FetchedMedia, MediaFetcher, OutboundTarget};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Graph API endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphConfig {
    /// Versioned API root
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com/v19.0".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Per-organization channel credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCredentials {
    pub access_token: String,
    /// WhatsApp Cloud sender number id
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Graph API client shared by every organization
#[derive(Clone)]
pub struct GraphClient {
    config: GraphConfig,
    client: reqwest::Client,
    credentials: Arc<RwLock<HashMap<Uuid, GraphCredentials>>>,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            credentials: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Register or replace an organization's credentials
    pub async fn set_credentials(&self, organization_id: Uuid, credentials: GraphCredentials) {
        self.credentials
            .write()
            .await
            .insert(organization_id, credentials);
    }

    async fn credentials(&self, organization_id: Uuid) -> Result<GraphCredentials> {
        self.credentials
            .read()
            .await
            .get(&organization_id)
            .cloned()
            .ok_or_else(|| {
                RelayError::Config(format!("no Graph credentials for organization {}", organization_id))
            })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, token: &str, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::Delivery(format!("Graph API request failed: {}", e)))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Delivery(format!("Failed to parse Graph response: {}", e)))?;
        if !status.is_success() {
            return Err(RelayError::Delivery(describe_error(status.as_u16(), &body)));
        }
        Ok(body)
    }

    async fn download(&self, url: &str, token: Option<&str>) -> Result<FetchedMedia> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| RelayError::Media(format!("download failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Media(format!("download returned {}", status)));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let file_name = file_name_from_url(url);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::Media(format!("download interrupted: {}", e)))?;
        Ok(FetchedMedia {
            bytes,
            content_type,
            file_name,
        })
    }
}

fn describe_error(status: u16, body: &serde_json::Value) -> String {
    match serde_json::from_value::<GraphError>(body.clone()) {
        Ok(GraphError { error }) => match error.code {
            Some(code) => format!("Graph API error ({}, code {}): {}", status, code, error.message),
            None => format!("Graph API error ({}): {}", status, error.message),
        },
        Err(_) => format!("Graph API error ({})", status),
    }
}

fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty() && name.contains('.')).then(|| name.to_string())
}

/// WhatsApp Cloud text message body
pub fn whatsapp_text_body(target: &OutboundTarget, text: &str) -> serde_json::Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": target.recipient,
        "type": "text",
        "text": {"body": text, "preview_url": false},
    });
    if let Some(ref reply_to) = target.reply_to {
        body["context"] = json!({"message_id": reply_to});
    }
    body
}

/// Messenger / Instagram Send API text body
pub fn messenger_text_body(target: &OutboundTarget, text: &str) -> serde_json::Value {
    json!({
        "recipient": {"id": target.recipient},
        "messaging_type": "RESPONSE",
        "message": {"text": text},
    })
}

/// Provider message id from a send response
pub fn sent_message_id(body: &serde_json::Value) -> Option<String> {
    body.pointer("/messages/0/id")
        .or_else(|| body.get("message_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl ChannelSender for GraphClient {
    async fn send_text(&self, target: &OutboundTarget, text: &str) -> Result<Option<String>> {
        let credentials = self.credentials(target.organization_id).await?;
        let response = match target.platform {
            Platform::WhatsApp => {
                let phone_number_id = credentials.phone_number_id.as_deref().ok_or_else(|| {
                    RelayError::Config("WhatsApp credentials need a phone number id".to_string())
                })?;
                let path = format!("{}/messages", phone_number_id);
                self.post(&credentials.access_token, &path, &whatsapp_text_body(target, text))
                    .await?
            }
            Platform::Instagram | Platform::Facebook => {
                self.post(
                    &credentials.access_token,
                    "me/messages",
                    &messenger_text_body(target, text),
                )
                .await?
            }
            Platform::Email => {
                return Err(RelayError::NotImplemented(
                    "email is not sent through the Graph API".to_string(),
                ))
            }
        };

        let id = sent_message_id(&response);
        tracing::debug!(
            platform = %target.platform,
            recipient = %target.recipient,
            message_id = ?id,
            "Graph message sent"
        );
        Ok(id)
    }

    async fn send_typing(&self, target: &OutboundTarget) -> Result<()> {
        let credentials = self.credentials(target.organization_id).await?;
        match target.platform {
            Platform::WhatsApp => {
                // The indicator is attached to the message being answered
                let (Some(phone_number_id), Some(reply_to)) =
                    (credentials.phone_number_id.as_deref(), target.reply_to.as_deref())
                else {
                    return Ok(());
                };
                let body = json!({
                    "messaging_product": "whatsapp",
                    "status": "read",
                    "message_id": reply_to,
                    "typing_indicator": {"type": "text"},
                });
                self.post(&credentials.access_token, &format!("{}/messages", phone_number_id), &body)
                    .await?;
            }
            Platform::Instagram | Platform::Facebook => {
                let body = json!({
                    "recipient": {"id": target.recipient},
                    "sender_action": "typing_on",
                });
                self.post(&credentials.access_token, "me/messages", &body).await?;
            }
            Platform::Email => {}
        }
        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for GraphClient {
    async fn fetch(
        &self,
        organization_id: Uuid,
        platform: Platform,
        reference: &str,
    ) -> Result<FetchedMedia> {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return self.download(reference, None).await;
        }
        if platform != Platform::WhatsApp {
            return Err(RelayError::Media(format!(
                "{} media reference '{}' is not a URL",
                platform, reference
            )));
        }

        // WhatsApp hands out media ids: resolve to a short-lived URL first
        let credentials = self.credentials(organization_id).await?;
        let resp = self
            .client
            .get(self.endpoint(reference))
            .bearer_auth(&credentials.access_token)
            .send()
            .await
            .map_err(|e| RelayError::Media(format!("media lookup failed: {}", e)))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Media(format!("Failed to parse media lookup: {}", e)))?;
        if !status.is_success() {
            return Err(RelayError::Media(describe_error(status.as_u16(), &body)));
        }
        let info: MediaInfo = serde_json::from_value(body)?;

        let mut media = self.download(&info.url, Some(&credentials.access_token)).await?;
        if media.content_type.is_none() {
            media.content_type = info.mime_type;
        }
        Ok(media)
    }
}

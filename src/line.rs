//! LINE Messaging API client: webhook envelope types, signature
//! verification, reply with push fallback, and binary content download.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Inbound webhook payload: a delivery bundling zero or more events.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(rename = "replyToken")]
    pub reply_token: Option<String>,
    pub source: Option<EventSource>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSource {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub id: String,
    pub text: Option<String>,
}

/// Verify the `x-line-signature` header: HMAC-SHA256 of the raw body with
/// the channel secret, base64-encoded, compared in constant time.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature_b64: &str) -> bool {
    if channel_secret.is_empty() || signature_b64.is_empty() {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(channel_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    let computed = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    constant_time_eq(&computed, signature_b64)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fetches raw attachment bytes for a message id. The engine depends on
/// this seam rather than the concrete client.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Returns the raw bytes and their content type.
    async fn fetch_content(&self, message_id: &str) -> Result<(Vec<u8>, String), String>;
}

/// Outbound LINE API client.
pub struct LineClient {
    token: String,
    api_base: String,
    data_api_base: String,
    http: reqwest::Client,
}

impl LineClient {
    pub fn new(token: String, timeout: Duration) -> Self {
        Self::with_bases(
            token,
            "https://api.line.me".to_string(),
            "https://api-data.line.me".to_string(),
            timeout,
        )
    }

    pub fn with_bases(
        token: String,
        api_base: String,
        data_api_base: String,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self { token, api_base, data_api_base, http }
    }

    /// Push a text message to a known user.
    pub async fn push(&self, to: &str, text: &str) -> Result<(), String> {
        let url = format!("{}/v2/bot/message/push", self.api_base);
        let body = serde_json::json!({
            "to": to,
            "messages": [{ "type": "text", "text": text }],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("LINE push failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let t = response.text().await.unwrap_or_default();
            let preview: String = t.chars().take(200).collect();
            return Err(format!("LINE push failed: {status} {preview}"));
        }
        Ok(())
    }

    /// Reply using a short-lived reply token. When the reply fails (most
    /// commonly an expired token after deferred processing), fall back to a
    /// push to the given user.
    pub async fn reply(
        &self,
        reply_token: &str,
        text: &str,
        fallback_to: Option<&str>,
    ) -> Result<(), String> {
        let url = format!("{}/v2/bot/message/reply", self.api_base);
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [{ "type": "text", "text": text }],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("LINE reply failed: {e}"))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let t = response.text().await.unwrap_or_default();
        let preview: String = t.chars().take(200).collect();
        warn!(target: "line", %status, "reply failed: {preview}");

        if let Some(to) = fallback_to {
            match self.push(to, text).await {
                Ok(()) => {
                    info!(target: "line", "reply failed but push fallback delivered");
                    return Ok(());
                }
                Err(e) => warn!(target: "line", "push fallback failed: {e}"),
            }
        }

        Err(format!("LINE reply failed: {status} {preview}"))
    }
}

#[async_trait]
impl ContentFetcher for LineClient {
    async fn fetch_content(&self, message_id: &str) -> Result<(Vec<u8>, String), String> {
        let url = format!("{}/v2/bot/message/{}/content", self.data_api_base, message_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| format!("LINE content fetch failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let t = response.text().await.unwrap_or_default();
            let preview: String = t.chars().take(200).collect();
            return Err(format!("LINE content fetch failed: {status} {preview}"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("LINE content read failed: {e}"))?;

        Ok((bytes.to_vec(), content_type))
    }
}

//! OpenAI Responses API client: plain text, JSON-schema-constrained text,
//! and JSON-schema vision calls.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

pub struct Client {
    api_key: String,
    text_model: String,
    vision_model: String,
    http: reqwest::Client,
}

#[derive(Debug)]
pub enum Error {
    /// Transport-level failure (connect, timeout).
    Http(String),
    /// Non-2xx status from the provider.
    Api(String),
    /// Response body did not parse.
    Parse(String),
    /// Parsed JSON missing required fields.
    Schema(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Schema(e) => write!(f, "Schema error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Deserialize)]
struct ApiResponse {
    output_text: Option<String>,
    output: Option<Vec<OutputItem>>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct OutputContent {
    text: Option<String>,
}

/// Output text lives either in `output_text` or nested in `output[]`.
fn pick_output_text(data: &ApiResponse) -> String {
    if let Some(t) = &data.output_text {
        if !t.trim().is_empty() {
            return t.trim().to_string();
        }
    }
    if let Some(items) = &data.output {
        for item in items {
            for c in &item.content {
                if let Some(t) = &c.text {
                    if !t.trim().is_empty() {
                        return t.trim().to_string();
                    }
                }
            }
            if let Some(t) = &item.text {
                if !t.trim().is_empty() {
                    return t.trim().to_string();
                }
            }
        }
    }
    data.text.as_deref().unwrap_or("").trim().to_string()
}

impl Client {
    pub fn new(
        api_key: String,
        text_model: String,
        vision_model: String,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self { api_key, text_model, vision_model, http }
    }

    async fn post_responses(
        &self,
        body: serde_json::Value,
        model: &str,
    ) -> Result<String, Error> {
        if self.api_key.is_empty() {
            return Err(Error::Api("missing OpenAI API key".to_string()));
        }

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(RESPONSES_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let dur_ms = started.elapsed().as_millis();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(target: "openai", %status, model, dur_ms, "request failed: {}", truncate(&text, 800));
            return Err(Error::Api(format!("{status}: {}", truncate(&text, 300))));
        }

        let data: ApiResponse = response.json().await.map_err(|e| Error::Parse(e.to_string()))?;
        let out = pick_output_text(&data);
        debug!(target: "openai", model, dur_ms, "ok: {}", truncate(&out, 260));

        if out.is_empty() {
            return Err(Error::Empty);
        }
        Ok(out)
    }

    /// Plain text generation.
    pub async fn responses_text(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, Error> {
        let body = serde_json::json!({
            "model": self.text_model,
            "input": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "max_output_tokens": max_tokens,
        });
        self.post_responses(body, &self.text_model).await
    }

    /// Text generation constrained to a strict JSON schema. Returns the
    /// parsed JSON value.
    pub async fn responses_json_schema(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
        max_tokens: u32,
    ) -> Result<serde_json::Value, Error> {
        let body = serde_json::json!({
            "model": self.text_model,
            "input": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": schema_name,
                    "strict": true,
                    "schema": schema,
                }
            },
            "max_output_tokens": max_tokens,
        });
        let out = self.post_responses(body, &self.text_model).await?;
        serde_json::from_str(&out).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Vision call with an inline image, constrained to a strict JSON schema.
    pub async fn responses_vision_json(
        &self,
        prompt: &str,
        image_data_url: &str,
        schema_name: &str,
        schema: serde_json::Value,
        max_tokens: u32,
    ) -> Result<serde_json::Value, Error> {
        let body = serde_json::json!({
            "model": self.vision_model,
            "input": [
                {
                    "role": "user",
                    "content": [
                        { "type": "input_text", "text": prompt },
                        { "type": "input_image", "image_url": image_data_url },
                    ],
                }
            ],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": schema_name,
                    "strict": true,
                    "schema": schema,
                }
            },
            "max_output_tokens": max_tokens,
        });
        let out = self.post_responses(body, &self.vision_model).await?;
        serde_json::from_str(&out).map_err(|e| Error::Parse(e.to_string()))
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() > n {
        format!("{}...", s.chars().take(n).collect::<String>())
    } else {
        s.to_string()
    }
}

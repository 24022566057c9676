//! Gemini API client, used as the translation fallback provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self { api_key, model, client }
    }

    /// Generate text from a prompt.
    pub async fn generate_text(&self, prompt: &str) -> Result<String, String> {
        if self.api_key.is_empty() {
            return Err("missing Gemini API key".to_string());
        }

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt.to_string() }],
            }],
        };

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_BASE, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {e}"))?;

        if !status.is_success() {
            warn!(target: "gemini", %status, "request failed");
            let preview: String = body.chars().take(300).collect();
            return Err(format!("API error {status}: {preview}"));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).map_err(|e| format!("Failed to parse response: {e}"))?;

        if let Some(error) = parsed.error {
            return Err(format!("Gemini error: {}", error.message));
        }

        let text: String = parsed
            .candidates
            .as_deref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err("Gemini returned empty text".to_string());
        }

        debug!(target: "gemini", "ok: {} chars", text.len());
        Ok(text)
    }

    /// Translate Japanese website copy into natural English.
    pub async fn translate_to_english(&self, ja_text: &str) -> Result<String, String> {
        let prompt = format!(
            "Translate the following Japanese into natural English for a website (concise, no extra commentary). Output ONLY the English text.\n\nJapanese:\n{ja_text}"
        );
        let en = self.generate_text(&prompt).await?;
        Ok(en.trim().to_string())
    }
}

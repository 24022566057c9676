//! Image classification: one schema-constrained vision call turns an image
//! into a draft post, and a confidence gate decides whether it may be
//! published without confirmation.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::bot::commands::PostType;
use crate::bot::dates::padded_date_or_today;
use crate::bot::html::nl2br;
use crate::openai;

/// Raw provider output, straight from the JSON schema.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionRaw {
    #[serde(rename = "type")]
    pub post_type: String,
    pub date: String,
    pub ja_html: String,
    pub en_html: String,
    pub confidence: f64,
    pub has_event_info: bool,
}

/// Normalized classification result carried in the pending-image state.
#[derive(Debug, Clone)]
pub struct VisionPost {
    pub post_type: PostType,
    pub date: String,
    pub ja_html: String,
    pub en_html: String,
    pub confidence: f64,
    pub has_event_info: bool,
}

/// Provider seam for the classification call.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn classify_image(&self, image_data_url: &str) -> Result<VisionRaw, String>;
}

const VISION_PROMPT: &str = r#"You are generating content for the website of a Japanese traditional performing arts artist.

The site definitions are strict:
- news = upcoming performance information (future events / announcements)
- archive = past performance record (past events)
- voice = a personal murmur / the world as seen by the artist (landscapes, snapshots, backstage vibes)

Classification rules:
1) Only choose news/archive if the image clearly contains event-related text (flyer/poster/program) such as date/time/venue/price/program or event title. Otherwise choose voice.
2) If event text exists, determine whether it is future (news) or past (archive) based on the date compared to TODAY in JST.
3) If the date is not visible, use today's JST date, BUT do not force news/archive unless event text is clearly present.

Output fields:
- type: news|voice|archive
- has_event_info: true only if there is clear flyer/poster/program info
- date: YYYY.MM.DD padded
- ja_html: Japanese website-ready copy. Use <br> if appropriate. No URLs.
- en_html: natural English translation of ja_html. Use <br>. No URLs.
- confidence: 0.0-1.0 overall confidence

Do NOT invent names/numbers not visible. Return STRICT JSON only."#;

fn vision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "type": { "type": "string", "enum": ["news", "voice", "archive"] },
            "date": { "type": "string", "description": "YYYY.MM.DD padded" },
            "ja_html": { "type": "string" },
            "en_html": { "type": "string" },
            "confidence": { "type": "number" },
            "has_event_info": { "type": "boolean" }
        },
        "required": ["type", "date", "ja_html", "en_html", "confidence", "has_event_info"]
    })
}

#[async_trait]
impl VisionProvider for openai::Client {
    async fn classify_image(&self, image_data_url: &str) -> Result<VisionRaw, String> {
        let value = self
            .responses_vision_json(VISION_PROMPT, image_data_url, "vision_post", vision_schema(), 650)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| format!("vision JSON shape: {e}"))
    }
}

/// Normalize a raw classification: parse the type (default voice), clamp the
/// date to padded-or-today, and force explicit `<br>` line breaks in both
/// bodies, with `en_html` falling back to `ja_html`.
pub fn normalize(raw: VisionRaw) -> VisionPost {
    let post_type = PostType::parse(&raw.post_type).unwrap_or(PostType::Voice);
    let ja_html = nl2br(&raw.ja_html);
    let en_html = {
        let en = nl2br(&raw.en_html);
        if en.is_empty() { ja_html.clone() } else { en }
    };

    VisionPost {
        post_type,
        date: padded_date_or_today(&raw.date),
        ja_html,
        en_html,
        confidence: raw.confidence,
        has_event_info: raw.has_event_info,
    }
}

/// Confidence thresholds for unattended posting, clamped to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct AutopostThresholds {
    pub news: f64,
    pub voice: f64,
}

impl AutopostThresholds {
    pub fn new(news: f64, voice: f64) -> Self {
        Self { news: news.clamp(0.0, 1.0), voice: voice.clamp(0.0, 1.0) }
    }
}

impl Default for AutopostThresholds {
    fn default() -> Self {
        Self { news: 0.85, voice: 0.90 }
    }
}

/// Decide whether a classified image may be posted without confirmation.
///
/// A manual destination override always forces the confirm-then-post path,
/// regardless of confidence.
pub fn should_autopost(
    generated: &VisionPost,
    post_type: PostType,
    forced: bool,
    thresholds: &AutopostThresholds,
) -> bool {
    if forced {
        return false;
    }
    match post_type {
        PostType::News | PostType::Archive => {
            generated.has_event_info && generated.confidence >= thresholds.news
        }
        PostType::Voice => {
            !generated.has_event_info && generated.confidence >= thresholds.voice
        }
    }
}

/// Inline data URL for a vision request.
pub fn to_data_url(content_type: &str, bytes: &[u8]) -> String {
    let ct = if content_type.is_empty() { "image/jpeg" } else { content_type };
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{ct};base64,{b64}")
}

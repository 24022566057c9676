//! Bilingual copy generation with a provider fallback chain.
//!
//! The pipeline never fails: every strategy is attempted at most once, and
//! when everything is exhausted the raw input is used as-is with `en`
//! mirroring `ja`.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::gemini::GeminiClient;
use crate::openai;

pub const DEFAULT_BTN_JA: &str = "詳細を見る";
pub const DEFAULT_BTN_EN: &str = "View Details";

/// Generated bilingual copy for one post.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCopy {
    pub ja: String,
    pub en: String,
    pub btn_ja: String,
    pub btn_en: String,
}

/// Primary provider: schema-constrained single-call generation, plus the
/// two independent steps of the degraded strategy.
#[async_trait]
pub trait CopyProvider: Send + Sync {
    /// One schema-constrained call yielding the full copy set.
    async fn copy_json(&self, input: &str, for_news: bool) -> Result<GeneratedCopy, String>;
    /// Japanese rewrite step of the degraded strategy.
    async fn rewrite_ja(&self, input: &str, for_news: bool) -> Result<String, String>;
    /// English translation step of the degraded strategy.
    async fn translate_en(&self, ja: &str) -> Result<String, String>;
}

/// Secondary translation-only provider.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate_en(&self, ja: &str) -> Result<String, String>;
}

static JAPANESE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ぁ-んァ-ヶ一-龠]").unwrap());

/// True when the text visually reads as Japanese. Empty text counts as
/// Japanese so it never passes as a valid translation.
pub fn looks_japanese(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    JAPANESE_RE.is_match(s)
}

fn en_insufficient(en: &str) -> bool {
    en.is_empty() || en.chars().count() < 4 || looks_japanese(en)
}

/// Ordered-strategy generation pipeline.
pub struct CopyPipeline {
    primary: Arc<dyn CopyProvider>,
    secondary: Arc<dyn Translator>,
    /// Use the degraded two-call strategy instead of the schema call.
    two_step: bool,
}

impl CopyPipeline {
    pub fn new(
        primary: Arc<dyn CopyProvider>,
        secondary: Arc<dyn Translator>,
        two_step: bool,
    ) -> Self {
        Self { primary, secondary, two_step }
    }

    /// Generate bilingual copy for a submission. Never errors: each failed
    /// strategy degrades to the next one, down to `en = ja`.
    pub async fn generate(&self, content: &str, for_news: bool) -> GeneratedCopy {
        let raw = content.trim();
        if self.two_step {
            self.generate_two_step(raw, for_news).await
        } else {
            self.generate_schema(raw, for_news).await
        }
    }

    async fn generate_schema(&self, raw: &str, for_news: bool) -> GeneratedCopy {
        match self.primary.copy_json(raw, for_news).await {
            Ok(mut copy) => {
                if copy.ja.is_empty() {
                    copy.ja = raw.to_string();
                }
                if copy.btn_ja.is_empty() {
                    copy.btn_ja = DEFAULT_BTN_JA.to_string();
                }
                if copy.btn_en.is_empty() {
                    copy.btn_en = DEFAULT_BTN_EN.to_string();
                }
                copy.en = self.ensure_english(copy.en, &copy.ja).await;
                copy
            }
            Err(e) => {
                warn!(target: "openai", "copy generation failed: {e}");
                let ja = raw.to_string();
                let en = self.ensure_english(String::new(), &ja).await;
                GeneratedCopy {
                    ja,
                    en,
                    btn_ja: DEFAULT_BTN_JA.to_string(),
                    btn_en: DEFAULT_BTN_EN.to_string(),
                }
            }
        }
    }

    async fn generate_two_step(&self, raw: &str, for_news: bool) -> GeneratedCopy {
        let ja = match self.primary.rewrite_ja(raw, for_news).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) => raw.to_string(),
            Err(e) => {
                warn!(target: "openai", "ja rewrite failed: {e}");
                raw.to_string()
            }
        };

        let en = match self.primary.translate_en(&ja).await {
            Ok(out) => out.trim().to_string(),
            Err(e) => {
                warn!(target: "openai", "en translation failed: {e}");
                String::new()
            }
        };
        let en = self.ensure_english(en, &ja).await;

        GeneratedCopy {
            ja,
            en,
            btn_ja: DEFAULT_BTN_JA.to_string(),
            btn_en: DEFAULT_BTN_EN.to_string(),
        }
    }

    /// Run the secondary translator when `en` is missing, too short, or
    /// still in the source script; fall back to `ja` as the last resort.
    async fn ensure_english(&self, en: String, ja: &str) -> String {
        let mut en = en;
        if en_insufficient(&en) {
            match self.secondary.translate_en(ja).await {
                Ok(out) if !out.trim().is_empty() => en = out.trim().to_string(),
                Ok(_) => {}
                Err(e) => warn!(target: "gemini", "translation fallback failed: {e}"),
            }
        }
        if en.is_empty() { ja.to_string() } else { en }
    }
}

const COPY_SCHEMA_SYSTEM: &str = r#"You are a bilingual copy editor for a Japanese artist website.
You MUST output STRICT JSON that conforms to the provided JSON Schema (no markdown, no extra text).

Rules:
- "ja": natural Japanese, concise (website-ready)
- "en": natural English translation of "ja" (must not be empty)
- "btnJa"/"btnEn": button labels (use sensible defaults if no URL context)
- Prefer single-line text (no line breaks unless necessary for <br>)
- Always perform at least one minor edit to improve readability (punctuation/wording), unless the input is already perfect.
- If the input contains a URL, do NOT include the URL in "ja"/"en"."#;

const REWRITE_JA_SYSTEM: &str = r#"You are a Japanese copy editor for a Japanese artist website.
Rules:
- Return ONLY Japanese text (no quotes, no markdown, no commentary)
- Make it concise and website-ready
- If the input contains a URL, do NOT include the URL
- Do a minor improvement (punctuation/wording) unless already perfect
- Avoid line breaks unless necessary"#;

const TRANSLATE_EN_SYSTEM: &str = r#"You are a professional translator.
Rules:
- Output ONLY natural English text (no quotes, no markdown, no commentary)
- Keep it concise and website-ready
- Do NOT include any URL
- Preserve meaning; do not add new info"#;

fn copy_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "ja": { "type": "string" },
            "en": { "type": "string" },
            "btnJa": { "type": "string" },
            "btnEn": { "type": "string" }
        },
        "required": ["ja", "en", "btnJa", "btnEn"]
    })
}

#[async_trait]
impl CopyProvider for openai::Client {
    async fn copy_json(&self, input: &str, for_news: bool) -> Result<GeneratedCopy, String> {
        let user = if for_news {
            format!("Input:\n{input}\n\n(News item: keep it short, neutral, informative.)")
        } else {
            format!("Input:\n{input}")
        };
        let schema_name = if for_news { "news_copy" } else { "site_copy" };

        let value = self
            .responses_json_schema(COPY_SCHEMA_SYSTEM, &user, schema_name, copy_schema(), 450)
            .await
            .map_err(|e| e.to_string())?;

        let field = |k: &str| {
            value
                .get(k)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string()
        };
        let copy = GeneratedCopy {
            ja: field("ja"),
            en: field("en"),
            btn_ja: field("btnJa"),
            btn_en: field("btnEn"),
        };

        if copy.ja.is_empty() || copy.btn_ja.is_empty() || copy.btn_en.is_empty() {
            return Err(openai::Error::Schema("missing required copy fields".to_string())
                .to_string());
        }
        Ok(copy)
    }

    async fn rewrite_ja(&self, input: &str, for_news: bool) -> Result<String, String> {
        let user = if for_news {
            format!("Input:\n{input}\n\nTask: Rewrite as a short neutral news line (Japanese only).")
        } else {
            format!("Input:\n{input}\n\nTask: Rewrite as a concise voice post (Japanese only).")
        };
        self.responses_text(REWRITE_JA_SYSTEM, &user, 220)
            .await
            .map_err(|e| e.to_string())
    }

    async fn translate_en(&self, ja: &str) -> Result<String, String> {
        let user = format!("Japanese:\n{ja}\n\nTask: Translate into natural English. Output ONLY English.");
        self.responses_text(TRANSLATE_EN_SYSTEM, &user, 260)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Translator for GeminiClient {
    async fn translate_en(&self, ja: &str) -> Result<String, String> {
        self.translate_to_english(ja).await
    }
}

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// The single administrator allowed to drive the bot.
    admin_user_id: String,
    line_channel_access_token: String,
    line_channel_secret: String,
    #[serde(default)]
    openai_api_key: String,
    /// Text generation model.
    openai_model: Option<String>,
    /// Vision model for image classification.
    openai_vision_model: Option<String>,
    #[serde(default)]
    gemini_api_key: String,
    gemini_model: Option<String>,
    /// Use the degraded two-call generation strategy instead of the
    /// schema-constrained single call.
    #[serde(default)]
    two_step_generation: bool,
    /// Auto-post confidence floor for news/archive classifications.
    vision_autopost_min_conf: Option<f64>,
    /// Auto-post confidence floor for voice classifications.
    vision_autopost_voice_min_conf: Option<f64>,
    /// Images above this byte size go to blob storage instead of the
    /// asset host.
    image_asset_max_bytes: Option<u64>,
    #[serde(default)]
    github_owner: String,
    #[serde(default)]
    github_repo: String,
    github_branch: Option<String>,
    #[serde(default)]
    github_token: String,
    /// Directory for state files (blobs, content store, logs).
    data_dir: Option<String>,
    listen_addr: Option<String>,
    /// Process webhook deliveries after responding instead of before.
    /// Faster 200s, but the reply token may expire; replies then fall back
    /// to a push.
    #[serde(default)]
    defer_processing: bool,
    /// Timeout for all outbound calls, seconds.
    request_timeout_secs: Option<u64>,
    /// Public base URL for blob keys in read-API output.
    media_public_base: Option<String>,
}

fn clamp_f64(v: Option<f64>, default: f64, min: f64, max: f64) -> f64 {
    v.unwrap_or(default).clamp(min, max)
}

fn clamp_u64(v: Option<u64>, default: u64, min: u64, max: u64) -> u64 {
    v.unwrap_or(default).clamp(min, max)
}

pub struct Config {
    pub admin_user_id: String,
    pub line_channel_access_token: String,
    pub line_channel_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_vision_model: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub two_step_generation: bool,
    pub vision_autopost_min_conf: f64,
    pub vision_autopost_voice_min_conf: f64,
    pub image_asset_max_bytes: u64,
    pub github_owner: String,
    pub github_repo: String,
    pub github_branch: String,
    pub github_token: String,
    pub data_dir: PathBuf,
    pub listen_addr: String,
    pub defer_processing: bool,
    pub request_timeout: Duration,
    pub media_public_base: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.admin_user_id.trim().is_empty() {
            return Err(ConfigError::Validation("admin_user_id is required".into()));
        }
        if file.line_channel_access_token.is_empty() {
            return Err(ConfigError::Validation("line_channel_access_token is required".into()));
        }
        if file.line_channel_secret.is_empty() {
            return Err(ConfigError::Validation("line_channel_secret is required".into()));
        }

        let timeout_secs = clamp_u64(file.request_timeout_secs, 12, 1, 120);

        Ok(Self {
            admin_user_id: file.admin_user_id.trim().to_string(),
            line_channel_access_token: file.line_channel_access_token,
            line_channel_secret: file.line_channel_secret,
            openai_api_key: file.openai_api_key,
            openai_model: file
                .openai_model
                .unwrap_or_else(|| "gpt-5-mini-2025-08-07".to_string()),
            openai_vision_model: file
                .openai_vision_model
                .unwrap_or_else(|| "gpt-4.1-mini".to_string()),
            gemini_api_key: file.gemini_api_key,
            gemini_model: file.gemini_model.unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            two_step_generation: file.two_step_generation,
            vision_autopost_min_conf: clamp_f64(file.vision_autopost_min_conf, 0.85, 0.0, 1.0),
            vision_autopost_voice_min_conf: clamp_f64(
                file.vision_autopost_voice_min_conf,
                0.90,
                0.0,
                1.0,
            ),
            image_asset_max_bytes: clamp_u64(
                file.image_asset_max_bytes,
                2_500_000,
                100_000,
                20_000_000,
            ),
            github_owner: file.github_owner,
            github_repo: file.github_repo,
            github_branch: file.github_branch.unwrap_or_else(|| "main".to_string()),
            github_token: file.github_token,
            data_dir: file.data_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            listen_addr: file.listen_addr.unwrap_or_else(|| "0.0.0.0:8787".to_string()),
            defer_processing: file.defer_processing,
            request_timeout: Duration::from_secs(timeout_secs),
            media_public_base: file.media_public_base,
        })
    }
}

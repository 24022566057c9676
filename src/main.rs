mod bot;
mod config;
mod gemini;
mod line;
mod openai;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use bot::database::Post;
use bot::generate::CopyPipeline;
use bot::media::GitHubAssetHost;
use bot::vision::AutopostThresholds;
use bot::{BlobStore, Database, Engine, EngineConfig, PostType, SessionStore};
use config::Config;
use gemini::GeminiClient;
use line::{LineClient, WebhookPayload, verify_signature};

struct AppState {
    config: Config,
    engine: Engine,
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "kurogo.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("kurogo.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting kurogo...");
    info!("Loaded config from {config_path}");
    info!("Admin user: {}", config.admin_user_id);
    if config.defer_processing {
        info!("Deferred webhook processing enabled (reply tokens may expire; push fallback applies)");
    }

    let state = Arc::new(build_state(config));

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/line-webhook", post(handle_line_webhook))
        .route("/posts", get(handle_posts))
        .route("/api/{type}", get(handle_posts_alias))
        .route("/media/{*key}", get(handle_media))
        .with_state(state.clone());

    let addr = state.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listen address");
    info!("Listening on {addr}");

    axum::serve(listener, app).await.expect("server error");
}

fn build_state(config: Config) -> AppState {
    let db = Arc::new(Database::open(&config.data_dir.join("content.db")));
    let blobs = Arc::new(BlobStore::new(config.data_dir.clone()));

    let line_client = Arc::new(LineClient::new(
        config.line_channel_access_token.clone(),
        config.request_timeout,
    ));
    let openai_client = Arc::new(openai::Client::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
        config.openai_vision_model.clone(),
        config.request_timeout,
    ));
    let gemini_client = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.request_timeout,
    ));
    let assets = Arc::new(GitHubAssetHost::new(
        config.github_owner.clone(),
        config.github_repo.clone(),
        config.github_branch.clone(),
        config.github_token.clone(),
        config.request_timeout,
    ));

    let copy = CopyPipeline::new(
        openai_client.clone(),
        gemini_client,
        config.two_step_generation,
    );

    let engine = Engine::new(
        EngineConfig {
            admin_user_id: config.admin_user_id.clone(),
            image_asset_max_bytes: config.image_asset_max_bytes,
            thresholds: AutopostThresholds::new(
                config.vision_autopost_min_conf,
                config.vision_autopost_voice_min_conf,
            ),
        },
        SessionStore::new(),
        db.clone(),
        line_client.clone(),
        line_client,
        blobs.clone(),
        assets,
        copy,
        openai_client,
    );

    AppState { config, engine, db, blobs }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_line_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !verify_signature(&state.config.line_channel_secret, &body, signature) {
        warn!(target: "line", "webhook rejected: bad signature");
        return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "line", "webhook rejected: bad json: {e}");
            return (StatusCode::BAD_REQUEST, "bad json").into_response();
        }
    };

    if state.config.defer_processing {
        // Respond immediately; the reply token races against its expiry and
        // may need the push fallback.
        let state = state.clone();
        tokio::spawn(async move {
            state.engine.process_webhook(payload).await;
        });
    } else {
        state.engine.process_webhook(payload).await;
    }

    (StatusCode::OK, "OK").into_response()
}

#[derive(Deserialize)]
struct PostsQuery {
    #[serde(rename = "type")]
    post_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(rename = "onlyEnabled")]
    only_enabled: Option<String>,
}

/// Read-API row: post columns with storage keys normalized into fetchable
/// paths.
#[derive(serde::Serialize)]
struct ApiPost {
    id: i64,
    #[serde(rename = "type")]
    post_type: &'static str,
    date: String,
    view_date: Option<String>,
    ja_html: String,
    en_html: String,
    ja_link_text: String,
    ja_link_href: String,
    en_link_text: String,
    en_link_href: String,
    image_src: Option<String>,
    image_kind: Option<String>,
    media_type: String,
    media_src: Option<String>,
    poster_src: Option<String>,
    enabled: &'static str,
    legacy_key: String,
    created_at: String,
    updated_at: Option<String>,
}

/// Blob keys become URLs under the public base (or the local `/media/`
/// route); URLs and asset filenames pass through untouched.
fn normalize_src(public_base: &Option<String>, src: Option<String>) -> Option<String> {
    let s = src?.trim().to_string();
    if s.is_empty() {
        return None;
    }
    if s.starts_with("http://") || s.starts_with("https://") {
        return Some(s);
    }
    if s.starts_with("media/") {
        return Some(match public_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), s),
            None => format!("/media/{s}"),
        });
    }
    Some(s)
}

fn to_api_post(public_base: &Option<String>, post: Post) -> ApiPost {
    ApiPost {
        id: post.id,
        post_type: post.post_type.as_str(),
        date: post.date,
        view_date: post.view_date,
        ja_html: post.ja_html,
        en_html: post.en_html,
        ja_link_text: post.ja_link_text,
        ja_link_href: post.ja_link_href,
        en_link_text: post.en_link_text,
        en_link_href: post.en_link_href,
        image_src: normalize_src(public_base, post.image_src),
        image_kind: post.image_kind,
        media_type: post.media_type,
        media_src: normalize_src(public_base, post.media_src),
        poster_src: normalize_src(public_base, post.poster_src),
        enabled: if post.enabled { "TRUE" } else { "FALSE" },
        legacy_key: post.legacy_key,
        created_at: post.created_at,
        updated_at: post.updated_at,
    }
}

fn list_posts_response(state: &AppState, raw_type: &str, query: &PostsQuery) -> Response {
    let Some(post_type) = PostType::parse(raw_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": "invalid type",
                "allowed": ["news", "voice", "archive"],
                "got": raw_type,
            })),
        )
            .into_response();
    };

    let only_enabled = query.only_enabled.as_deref() != Some("0");
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).clamp(0, 1_000_000);

    match state.db.list_posts(post_type, only_enabled, limit, offset) {
        Ok(posts) => {
            let out: Vec<ApiPost> = posts
                .into_iter()
                .map(|p| to_api_post(&state.config.media_public_base, p))
                .collect();
            Json(out).into_response()
        }
        Err(e) => {
            error!(target: "db", "posts query failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "query failed").into_response()
        }
    }
}

async fn handle_posts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostsQuery>,
) -> Response {
    let raw_type = query.post_type.clone().unwrap_or_else(|| "news".to_string());
    list_posts_response(&state, raw_type.trim(), &query)
}

async fn handle_posts_alias(
    State(state): State<Arc<AppState>>,
    Path(raw_type): Path<String>,
    Query(query): Query<PostsQuery>,
) -> Response {
    list_posts_response(&state, raw_type.trim(), &query)
}

fn content_type_for_key(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

async fn handle_media(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    // Stored keys carry the media/ prefix; the route strips one copy of it.
    let full_key = if key.starts_with("media/") { key } else { format!("media/{key}") };
    match state.blobs.get(&full_key).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type_for_key(&full_key)),
                (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => {
            warn!(target: "db", "media read failed: {e}");
            (StatusCode::BAD_REQUEST, "bad key").into_response()
        }
    }
}

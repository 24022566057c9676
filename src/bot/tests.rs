//! Engine-level tests for the conversation state machine, run against stub
//! providers and an in-memory content store. Outbound chat replies point at
//! an unroutable local endpoint and are allowed to fail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::commands::PostType;
use super::database::Database;
use super::engine::{Engine, EngineConfig};
use super::generate::{CopyPipeline, CopyProvider, GeneratedCopy, Translator};
use super::media::{AssetHost, BlobStore};
use super::session::{SessionStore, UserState, VideoStage};
use super::vision::{AutopostThresholds, VisionProvider, VisionRaw};
use crate::line::{ContentFetcher, EventMessage, EventSource, LineClient, WebhookEvent, WebhookPayload};

const ADMIN: &str = "U_admin";

struct StubFetcher {
    bytes: Vec<u8>,
    content_type: String,
}

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch_content(&self, _message_id: &str) -> Result<(Vec<u8>, String), String> {
        Ok((self.bytes.clone(), self.content_type.clone()))
    }
}

struct StubAssets;

#[async_trait]
impl AssetHost for StubAssets {
    async fn upload_image(
        &self,
        _bytes: &[u8],
        _content_type: &str,
        message_id: &str,
    ) -> Result<String, String> {
        Ok(format!("voice_20260101_{message_id}_0.jpg"))
    }
}

struct StubCopy {
    fail: bool,
}

#[async_trait]
impl CopyProvider for StubCopy {
    async fn copy_json(&self, input: &str, _for_news: bool) -> Result<GeneratedCopy, String> {
        if self.fail {
            return Err("provider down".to_string());
        }
        Ok(GeneratedCopy {
            ja: input.to_string(),
            en: "Generated English.".to_string(),
            btn_ja: "詳細を見る".to_string(),
            btn_en: "View Details".to_string(),
        })
    }

    async fn rewrite_ja(&self, input: &str, _for_news: bool) -> Result<String, String> {
        if self.fail { Err("provider down".to_string()) } else { Ok(input.to_string()) }
    }

    async fn translate_en(&self, _ja: &str) -> Result<String, String> {
        if self.fail {
            Err("provider down".to_string())
        } else {
            Ok("Generated English.".to_string())
        }
    }
}

struct StubTranslator;

#[async_trait]
impl Translator for StubTranslator {
    async fn translate_en(&self, _ja: &str) -> Result<String, String> {
        Ok("Fallback English.".to_string())
    }
}

struct StubVision {
    result: Result<VisionRaw, String>,
}

#[async_trait]
impl VisionProvider for StubVision {
    async fn classify_image(&self, _image_data_url: &str) -> Result<VisionRaw, String> {
        self.result.clone()
    }
}

fn raw_vision(post_type: &str, confidence: f64, has_event_info: bool) -> VisionRaw {
    VisionRaw {
        post_type: post_type.to_string(),
        date: "2026.03.07".to_string(),
        ja_html: "公演チラシ\n3月7日 開演".to_string(),
        en_html: "Performance flyer\nMarch 7".to_string(),
        confidence,
        has_event_info,
    }
}

struct Harness {
    engine: Engine,
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
    _dir: tempfile::TempDir,
}

fn harness_with(vision: Result<VisionRaw, String>, image_bytes: Vec<u8>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::in_memory());
    let blobs = Arc::new(BlobStore::new(dir.path().to_path_buf()));

    // Unroutable endpoint: replies fail fast and are swallowed.
    let line = Arc::new(LineClient::with_bases(
        "test-token".to_string(),
        "http://127.0.0.1:9".to_string(),
        "http://127.0.0.1:9".to_string(),
        Duration::from_millis(200),
    ));

    let copy = CopyPipeline::new(
        Arc::new(StubCopy { fail: false }),
        Arc::new(StubTranslator),
        false,
    );

    let engine = Engine::new(
        EngineConfig {
            admin_user_id: ADMIN.to_string(),
            image_asset_max_bytes: 1000,
            thresholds: AutopostThresholds::default(),
        },
        SessionStore::new(),
        db.clone(),
        line,
        Arc::new(StubFetcher { bytes: image_bytes, content_type: "image/jpeg".to_string() }),
        blobs.clone(),
        Arc::new(StubAssets),
        copy,
        Arc::new(StubVision { result: vision }),
    );

    Harness { engine, db, blobs, _dir: dir }
}

fn harness(vision: Result<VisionRaw, String>) -> Harness {
    harness_with(vision, vec![0u8; 16])
}

fn event(user: &str, message_type: &str, id: &str, text: Option<&str>) -> WebhookPayload {
    WebhookPayload {
        events: vec![WebhookEvent {
            event_type: "message".to_string(),
            reply_token: Some("rt-test".to_string()),
            source: Some(EventSource { user_id: Some(user.to_string()) }),
            message: Some(EventMessage {
                message_type: message_type.to_string(),
                id: id.to_string(),
                text: text.map(str::to_string),
            }),
        }],
    }
}

fn text(t: &str) -> WebhookPayload {
    event(ADMIN, "text", "m-text", Some(t))
}

fn image(id: &str) -> WebhookPayload {
    event(ADMIN, "image", id, None)
}

fn video(id: &str) -> WebhookPayload {
    event(ADMIN, "video", id, None)
}

// =============================================================================
// TEXT SUBMISSIONS
// =============================================================================

mod text_submission {
    use super::*;

    #[tokio::test]
    async fn test_ignores_non_admin() {
        let h = harness(Err("unused".to_string()));
        h.engine
            .process_webhook(event("U_stranger", "text", "m1", Some("ニュース：本文")))
            .await;
        assert!(h.db.list_posts(PostType::News, false, 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_news_with_url_gets_link_fields() {
        let h = harness(Err("unused".to_string()));
        h.engine
            .process_webhook(text("ニュース：2026.3.7 公演のお知らせ https://example.com/live"))
            .await;

        let posts = h.db.list_posts(PostType::News, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.date, "2026.03.07");
        assert_eq!(post.view_date.as_deref(), Some("2026.3.7"));
        assert_eq!(post.ja_link_href, "https://example.com/live");
        assert_eq!(post.en_link_href, "https://example.com/live");
        assert_eq!(post.ja_link_text, "詳細を見る");
        assert!(!post.ja_html.contains("https://"));
        assert!(post.legacy_key.starts_with("news:2026.03.07:"));
    }

    #[tokio::test]
    async fn test_plain_text_defaults_to_voice_and_wraps() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("今日の稽古場から")).await;

        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].ja_html.starts_with("<span>"));
        assert!(posts[0].en_html.starts_with("<span>"));
        assert!(posts[0].legacy_key.starts_with("voice:"));
    }

    #[tokio::test]
    async fn test_resubmission_collapses_to_one_row() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("あ:2026.3.7 過去公演の記録")).await;
        h.engine.process_webhook(text("あ:2026.3.7 過去公演の記録")).await;

        let posts = h.db.list_posts(PostType::Archive, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].legacy_key, "archive:date:2026.03.07");
    }

    #[tokio::test]
    async fn test_batch_isolation_bad_event_does_not_stop_delivery() {
        let h = harness(Err("unused".to_string()));
        let payload = WebhookPayload {
            events: vec![
                // No message at all; skipped without error.
                WebhookEvent {
                    event_type: "follow".to_string(),
                    source: Some(EventSource { user_id: Some(ADMIN.to_string()) }),
                    ..Default::default()
                },
                text("通常の投稿").events.remove(0),
            ],
        };
        h.engine.process_webhook(payload).await;
        assert_eq!(h.db.list_posts(PostType::Voice, true, 10, 0).unwrap().len(), 1);
    }
}

// =============================================================================
// IMAGE INTAKE AND CONFIDENCE GATING
// =============================================================================

mod image_intake {
    use super::*;

    #[tokio::test]
    async fn test_low_confidence_news_lands_in_confirm_state() {
        let h = harness(Ok(raw_vision("news", 0.80, true)));
        h.engine.process_webhook(image("m-img")).await;

        // Below the 0.85 default threshold: no post.
        assert!(h.db.list_posts(PostType::News, false, 10, 0).unwrap().is_empty());

        match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingImage(p)) => {
                assert_eq!(p.image_src, "voice_20260101_m-img_0.jpg");
                let generated = p.generated.expect("classification should be kept");
                assert_eq!(generated.post_type, PostType::News);
                assert_eq!(generated.confidence, 0.80);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_high_confidence_news_autoposts_with_suffix() {
        let h = harness(Ok(raw_vision("news", 0.95, true)));
        h.engine.process_webhook(image("m-img")).await;

        let posts = h.db.list_posts(PostType::News, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.date, "2026.03.07");
        // Suffix on the first line only; the detail line is untouched.
        assert_eq!(post.ja_html, "公演チラシに出演します。<br>3月7日 開演");
        assert_eq!(post.en_html, "Performance flyer<br>March 7");
        assert_eq!(post.image_src.as_deref(), Some("voice_20260101_m-img_0.jpg"));

        assert!(h.engine.sessions().state(ADMIN).is_none());
    }

    #[tokio::test]
    async fn test_high_confidence_voice_autoposts_with_today() {
        let h = harness(Ok(raw_vision("voice", 0.95, false)));
        h.engine.process_webhook(image("m-img")).await;

        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        // Voice ignores the date seen in the image.
        assert_eq!(posts[0].date, super::super::dates::today_jst_padded());
        assert!(posts[0].ja_html.starts_with("<span>"));
        assert_eq!(posts[0].image_kind.as_deref(), Some("voice"));
    }

    #[tokio::test]
    async fn test_manual_override_forces_confirmation() {
        let h = harness(Ok(raw_vision("news", 0.99, true)));
        h.engine.process_webhook(text("NEXT:アーカイブ")).await;
        h.engine.process_webhook(image("m-img")).await;

        // Confidence is beyond any threshold, but the hint wins.
        assert!(h.db.list_posts(PostType::News, false, 10, 0).unwrap().is_empty());
        assert!(h.db.list_posts(PostType::Archive, false, 10, 0).unwrap().is_empty());

        match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingImage(p)) => {
                assert_eq!(p.forced_type, Some(PostType::Archive));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_image_goes_to_blob_and_skips_classification() {
        // 2000 bytes > the 1000-byte test threshold.
        let h = harness_with(Ok(raw_vision("news", 0.99, true)), vec![0u8; 2000]);
        h.engine.process_webhook(image("m-big")).await;

        assert!(h.db.list_posts(PostType::News, false, 10, 0).unwrap().is_empty());

        match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingImage(p)) => {
                assert!(p.image_src.starts_with("media/image/"));
                assert!(p.generated.is_none());
                assert!(h.blobs.get(&p.image_src).await.unwrap().is_some());
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_classification_failure_keeps_pending_image() {
        let h = harness(Err("vision down".to_string()));
        h.engine.process_webhook(image("m-img")).await;

        match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingImage(p)) => assert!(p.generated.is_none()),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_image_consumed_by_text_submission() {
        let h = harness(Ok(raw_vision("news", 0.50, true)));
        h.engine.process_webhook(image("m-img")).await;
        h.engine.process_webhook(text("に:2026.3.7 公演のお知らせ")).await;

        let posts = h.db.list_posts(PostType::News, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].image_src.as_deref(), Some("voice_20260101_m-img_0.jpg"));
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }
}

// =============================================================================
// TYPE-ONLY COMMANDS AND OK CONFIRMATION
// =============================================================================

mod confirm_flow {
    use super::*;

    #[tokio::test]
    async fn test_type_command_then_ok_posts_as_forced_type() {
        let h = harness(Ok(raw_vision("news", 0.50, true)));
        h.engine.process_webhook(image("m-img")).await;
        h.engine.process_webhook(text("T:voice")).await;
        h.engine.process_webhook(text("OK")).await;

        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].ja_html.starts_with("<span>"));
        assert_eq!(posts[0].image_kind.as_deref(), Some("voice"));
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }

    #[tokio::test]
    async fn test_ok_posts_the_classified_draft() {
        let h = harness(Ok(raw_vision("archive", 0.50, true)));
        h.engine.process_webhook(image("m-img")).await;
        h.engine.process_webhook(text("OK")).await;

        let posts = h.db.list_posts(PostType::Archive, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].legacy_key, "archive:date:2026.03.07");
    }

    #[tokio::test]
    async fn test_ok_without_draft_posts_nothing() {
        let h = harness(Err("vision down".to_string()));
        h.engine.process_webhook(image("m-img")).await;
        h.engine.process_webhook(text("OK")).await;

        for t in [PostType::News, PostType::Voice, PostType::Archive] {
            assert!(h.db.list_posts(t, false, 10, 0).unwrap().is_empty());
        }
        // The pending image is still there, waiting for a text body.
        assert!(matches!(
            h.engine.sessions().state(ADMIN),
            Some(UserState::PendingImage(_))
        ));
    }

    #[tokio::test]
    async fn test_ok_without_pending_image_is_plain_text() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("OK")).await;

        // Falls through to a normal voice submission.
        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
    }
}

// =============================================================================
// EDIT SESSIONS
// =============================================================================

mod edit_session {
    use super::*;

    async fn seeded(h: &Harness) -> i64 {
        h.engine.process_webhook(text("に:2026.3.7 元の本文")).await;
        h.db.list_posts(PostType::News, true, 10, 0).unwrap()[0].id
    }

    #[tokio::test]
    async fn test_field_update_touches_single_field() {
        let h = harness(Err("unused".to_string()));
        let id = seeded(&h).await;
        let before = h.db.get_post(id).unwrap();

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("JA: 差し替えた本文")).await;

        let after = h.db.get_post(id).unwrap();
        assert_eq!(after.ja_html, "差し替えた本文");
        assert_eq!(after.en_html, before.en_html);
        assert_eq!(after.date, before.date);
        assert_eq!(after.ja_link_href, before.ja_link_href);

        // Still editing until an explicit end.
        assert!(matches!(h.engine.sessions().state(ADMIN), Some(UserState::Editing(_))));
        h.engine.process_webhook(text("完了")).await;
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }

    #[tokio::test]
    async fn test_edit_unknown_id_reports_not_found() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("編集:999")).await;
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }

    #[tokio::test]
    async fn test_date_update_rederives_view_date() {
        let h = harness(Err("unused".to_string()));
        let id = seeded(&h).await;

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("DATE: 2026.12.24")).await;

        let post = h.db.get_post(id).unwrap();
        assert_eq!(post.date, "2026.12.24");
        assert_eq!(post.view_date.as_deref(), Some("2026.12.24"));

        h.engine.process_webhook(text("DATE: 2/8")).await;
        let post = h.db.get_post(id).unwrap();
        assert!(post.date.ends_with(".02.08"));
        assert!(post.view_date.as_deref().unwrap().ends_with(".2.8"));
    }

    #[tokio::test]
    async fn test_type_update_rewraps_bodies() {
        let h = harness(Err("unused".to_string()));
        let id = seeded(&h).await;

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("TYPE: voice")).await;

        let post = h.db.get_post(id).unwrap();
        assert_eq!(post.post_type, PostType::Voice);
        assert!(post.ja_html.starts_with("<span>"));
        assert!(post.en_html.starts_with("<span>"));
        assert_eq!(post.view_date.as_deref(), Some("2026.3.7"));

        // Follow-up field updates use the new type's wrapping rule.
        h.engine.process_webhook(text("JA: 素の本文")).await;
        assert_eq!(h.db.get_post(id).unwrap().ja_html, "<span>素の本文</span>");
    }

    #[tokio::test]
    async fn test_type_update_rejects_unknown_type() {
        let h = harness(Err("unused".to_string()));
        let id = seeded(&h).await;

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("TYPE: banner")).await;

        assert_eq!(h.db.get_post(id).unwrap().post_type, PostType::News);
    }

    #[tokio::test]
    async fn test_cancel_leaves_post_untouched() {
        let h = harness(Err("unused".to_string()));
        let id = seeded(&h).await;
        let before = h.db.get_post(id).unwrap();

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("取消")).await;
        // Field updates after cancel are plain submissions, not edits.
        h.engine.process_webhook(text("BTNJA: 違うラベル")).await;

        let after = h.db.get_post(id).unwrap();
        assert_eq!(after.ja_link_text, before.ja_link_text);
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }
}

// =============================================================================
// DELETE COMMANDS
// =============================================================================

mod delete_command {
    use super::*;

    #[tokio::test]
    async fn test_range_delete_soft_disables() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("一つ目")).await;
        h.engine.process_webhook(text("二つ目")).await;
        let ids: Vec<i64> = h
            .db
            .list_posts(PostType::Voice, true, 10, 0)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();

        let (lo, hi) = (*ids.iter().min().unwrap(), *ids.iter().max().unwrap());
        h.engine.process_webhook(text(&format!("削除:{lo}-{hi}"))).await;

        assert!(h.db.list_posts(PostType::Voice, true, 10, 0).unwrap().is_empty());
        assert_eq!(h.db.list_posts(PostType::Voice, false, 10, 0).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_does_not_disturb_edit_session() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(text("に:2026.3.7 本文")).await;
        let id = h.db.list_posts(PostType::News, true, 10, 0).unwrap()[0].id;

        h.engine.process_webhook(text(&format!("編集:{id}"))).await;
        h.engine.process_webhook(text("削除:999")).await;

        assert!(matches!(h.engine.sessions().state(ADMIN), Some(UserState::Editing(_))));
    }
}

// =============================================================================
// VIDEO FLOW
// =============================================================================

mod video_flow {
    use super::*;

    #[tokio::test]
    async fn test_video_then_poster_then_text() {
        let h = harness(Ok(raw_vision("news", 0.99, true)));

        h.engine.process_webhook(video("m-vid")).await;
        match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingVideo(v)) => {
                assert_eq!(v.stage, VideoStage::AwaitPoster);
                assert!(v.video_key.starts_with("media/video/"));
                assert!(h.blobs.get(&v.video_key).await.unwrap().is_some());
            }
            other => panic!("unexpected state: {other:?}"),
        }

        // The next image becomes the poster, not an ordinary intake; no
        // classification happens even though the stub would auto-post.
        h.engine.process_webhook(image("m-poster")).await;
        let poster_key = match h.engine.sessions().state(ADMIN) {
            Some(UserState::PendingVideo(v)) => {
                assert_eq!(v.stage, VideoStage::AwaitText);
                v.poster_key.expect("poster stored")
            }
            other => panic!("unexpected state: {other:?}"),
        };
        assert!(poster_key.starts_with("media/poster/"));
        assert!(h.blobs.get(&poster_key).await.unwrap().is_some());
        assert!(h.db.list_posts(PostType::News, false, 10, 0).unwrap().is_empty());

        h.engine.process_webhook(text("V: 舞台裏の動画です")).await;
        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].media_type, "video");
        assert!(posts[0].media_src.as_deref().unwrap().starts_with("media/video/"));
        assert_eq!(posts[0].poster_src.as_deref(), Some(poster_key.as_str()));
        assert!(h.engine.sessions().state(ADMIN).is_none());
    }

    #[tokio::test]
    async fn test_text_before_poster_leaves_video_pending() {
        let h = harness(Err("unused".to_string()));
        h.engine.process_webhook(video("m-vid")).await;
        h.engine.process_webhook(text("まだサムネ前")).await;

        // The post goes out without the video attached.
        let posts = h.db.list_posts(PostType::Voice, true, 10, 0).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].media_type, "image");
        assert!(matches!(
            h.engine.sessions().state(ADMIN),
            Some(UserState::PendingVideo(_))
        ));
    }
}

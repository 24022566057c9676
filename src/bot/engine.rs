//! Orchestrator: consumes inbound webhook events and drives the per-user
//! conversation state machine.
//!
//! Events in one delivery are processed strictly in order, with per-event
//! error isolation: a failing event is logged and the rest of the delivery
//! still runs. Every outcome is reported back over chat, with a push
//! fallback when the reply token has gone stale.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bot::commands::{
    self, EditField, PostType, TypeOnlyCommand,
};
use crate::bot::database::{Database, NewPost, legacy_key};
use crate::bot::dates::{extract_date_padded, today_jst_padded, view_date_from_padded};
use crate::bot::html::{
    NEWS_FIRST_LINE_SUFFIX, add_news_suffix_to_first_line, extract_url, wrap_if_voice_span,
};
use crate::bot::generate::{CopyPipeline, DEFAULT_BTN_EN, DEFAULT_BTN_JA};
use crate::bot::media::{AssetHost, BlobStore, MediaKind, StoredImage, blob_key, ext_from_content_type};
use crate::bot::session::{
    EditingSession, PendingImage, PendingVideo, SessionStore, UserState, VideoStage,
};
use crate::bot::vision::{
    AutopostThresholds, VisionPost, VisionProvider, normalize, should_autopost, to_data_url,
};
use crate::line::{ContentFetcher, LineClient, WebhookEvent, WebhookPayload};

pub struct EngineConfig {
    /// Only this user's events are processed; everyone else is ignored.
    pub admin_user_id: String,
    /// Images above this size go to the blob store and skip classification.
    pub image_asset_max_bytes: u64,
    pub thresholds: AutopostThresholds,
}

pub struct Engine {
    config: EngineConfig,
    sessions: SessionStore,
    db: Arc<Database>,
    line: Arc<LineClient>,
    fetcher: Arc<dyn ContentFetcher>,
    blobs: Arc<BlobStore>,
    assets: Arc<dyn AssetHost>,
    copy: CopyPipeline,
    vision: Arc<dyn VisionProvider>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        sessions: SessionStore,
        db: Arc<Database>,
        line: Arc<LineClient>,
        fetcher: Arc<dyn ContentFetcher>,
        blobs: Arc<BlobStore>,
        assets: Arc<dyn AssetHost>,
        copy: CopyPipeline,
        vision: Arc<dyn VisionProvider>,
    ) -> Self {
        Self { config, sessions, db, line, fetcher, blobs, assets, copy, vision }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Process a full delivery. One event failing never aborts the rest.
    pub async fn process_webhook(&self, payload: WebhookPayload) {
        for event in &payload.events {
            if let Err(e) = self.process_event(event).await {
                let msg_type = event
                    .message
                    .as_ref()
                    .map(|m| m.message_type.as_str())
                    .unwrap_or("-");
                error!(target: "line", msg_type, "event processing failed: {e}");
            }
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> Result<(), String> {
        let Some(user_id) = event.source.as_ref().and_then(|s| s.user_id.as_deref()) else {
            return Ok(());
        };
        if user_id != self.config.admin_user_id {
            return Ok(());
        }
        let Some(msg) = &event.message else {
            return Ok(());
        };
        let reply_token = event.reply_token.as_deref();

        match msg.message_type.as_str() {
            "image" => self.handle_image(user_id, &msg.id, reply_token).await,
            "video" => self.handle_video(user_id, &msg.id, reply_token).await,
            "text" => {
                let text = msg.text.as_deref().unwrap_or("").trim().to_string();
                self.handle_text(user_id, &text, reply_token).await
            }
            _ => Ok(()),
        }
    }

    /// Reply is best-effort: a failed notification is logged, never fatal
    /// to the event.
    async fn notify(&self, reply_token: Option<&str>, user_id: &str, text: &str) {
        if let Some(token) = reply_token {
            if let Err(e) = self.line.reply(token, text, Some(user_id)).await {
                warn!(target: "line", "notification failed: {e}");
            }
        }
    }

    // ---------------------------------------------------------------
    // image
    // ---------------------------------------------------------------

    async fn handle_image(
        &self,
        user_id: &str,
        message_id: &str,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        // A video waiting for its poster diverts the image away from the
        // ordinary intake path.
        if let Some(UserState::PendingVideo(pending)) = self.sessions.state(user_id) {
            if pending.stage == VideoStage::AwaitPoster {
                return self.handle_poster(user_id, message_id, pending, reply_token).await;
            }
        }

        let (bytes, content_type) = self.fetcher.fetch_content(message_id).await?;

        let stored = match self.store_image(user_id, message_id, &bytes, &content_type).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(target: "line", "image store failed: {e}");
                self.notify(reply_token, user_id, "⚠️ 画像保存に失敗しました。").await;
                return Ok(());
            }
        };

        let forced = self.sessions.take_next_type(user_id);
        self.sessions.set_state(
            user_id,
            UserState::PendingImage(PendingImage {
                image_src: stored.src().to_string(),
                forced_type: forced,
                generated: None,
            }),
        );

        // Large images skip classification entirely.
        if let StoredImage::Blob(_) = stored {
            let text = match forced {
                Some(t) => format!(
                    "📷 画像を保存しました（ストレージ）。\n画像が大きいため自動読取はスキップしました。\n行き先は {} に確定済みです。\n続けて本文（に:/N:/A:/あ:/V:）を送ってください。",
                    t.label()
                ),
                None => "📷 画像を保存しました（ストレージ）。\n画像が大きいため自動読取はスキップしました。\n続けて本文（に:/N:/A:/あ:/V: または T:news 等）を送ってください。".to_string(),
            };
            self.notify(reply_token, user_id, &text).await;
            return Ok(());
        }

        let generated = match self
            .vision
            .classify_image(&to_data_url(&content_type, &bytes))
            .await
        {
            Ok(raw) => normalize(raw),
            Err(e) => {
                warn!(target: "openai", "vision classification failed: {e}");
                self.notify(
                    reply_token,
                    user_id,
                    "📷 画像は保存しました。自動読取に失敗したため、本文（に:/N:/A:/あ:/V:）を送ってください。",
                )
                .await;
                return Ok(());
            }
        };

        let post_type = forced.unwrap_or(generated.post_type);
        // Voice posts carry the submission date, even when the image shows
        // another one.
        let date = if post_type == PostType::Voice {
            today_jst_padded()
        } else {
            generated.date.clone()
        };

        let generated = VisionPost { post_type, date: date.clone(), ..generated };
        let confidence = generated.confidence;
        let image_src = stored.src().to_string();

        self.sessions.set_state(
            user_id,
            UserState::PendingImage(PendingImage {
                image_src: image_src.clone(),
                forced_type: forced,
                generated: Some(generated.clone()),
            }),
        );

        if should_autopost(&generated, post_type, forced.is_some(), &self.config.thresholds) {
            let post = build_image_post(post_type, &date, &generated, &image_src);
            let id = self.db.upsert_post(&post)?;
            self.sessions.clear_state(user_id);

            info!(target: "db", id, confidence, "auto-posted classified image");
            self.notify(
                reply_token,
                user_id,
                &format!(
                    "✅ 画像から自動投稿しました (ID:{id})\n[{}] date={date} (conf={confidence})\n必要なら「編集:{id}」で修正できます。",
                    post_type.label()
                ),
            )
            .await;
            return Ok(());
        }

        self.notify(
            reply_token,
            user_id,
            &format!(
                "📷 画像を保存しました。\n推定: [{}] date={date} (conf={confidence})\nこのままなら「OK」で投稿。\n種別変更は「T:voice / T:news / T:archive」。\n本文で上書きするなら（に:/N:/A:/あ:/V:）を送ってください。",
                post_type.label()
            ),
        )
        .await;
        Ok(())
    }

    async fn store_image(
        &self,
        user_id: &str,
        message_id: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredImage, String> {
        if bytes.len() as u64 > self.config.image_asset_max_bytes {
            let key = blob_key(
                MediaKind::Image,
                user_id,
                message_id,
                ext_from_content_type(content_type),
            );
            self.blobs.put(&key, bytes).await?;
            Ok(StoredImage::Blob(key))
        } else {
            let filename = self.assets.upload_image(bytes, content_type, message_id).await?;
            Ok(StoredImage::Asset(filename))
        }
    }

    async fn handle_poster(
        &self,
        user_id: &str,
        message_id: &str,
        mut pending: PendingVideo,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        let (bytes, content_type) = self.fetcher.fetch_content(message_id).await?;
        let poster_key = blob_key(
            MediaKind::Poster,
            user_id,
            &pending.video_message_id,
            ext_from_content_type(&content_type),
        );
        self.blobs.put(&poster_key, &bytes).await?;

        pending.stage = VideoStage::AwaitText;
        pending.poster_key = Some(poster_key);
        self.sessions.set_state(user_id, UserState::PendingVideo(pending));

        self.notify(
            reply_token,
            user_id,
            "🖼 サムネを受け取りました。続けて本文（N:/に: / V: / A:/あ:）を送ってください。",
        )
        .await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // video
    // ---------------------------------------------------------------

    async fn handle_video(
        &self,
        user_id: &str,
        message_id: &str,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        let (bytes, content_type) = self.fetcher.fetch_content(message_id).await?;
        let ct = if content_type.is_empty() { "video/mp4" } else { &content_type };
        let video_key = blob_key(MediaKind::Video, user_id, message_id, ext_from_content_type(ct));
        self.blobs.put(&video_key, &bytes).await?;

        self.sessions.set_state(
            user_id,
            UserState::PendingVideo(PendingVideo {
                stage: VideoStage::AwaitPoster,
                video_key,
                poster_key: None,
                video_message_id: message_id.to_string(),
            }),
        );

        self.notify(
            reply_token,
            user_id,
            "🎥 動画を受け取りました。続けてサムネ画像を送ってください。",
        )
        .await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // text
    // ---------------------------------------------------------------

    async fn handle_text(
        &self,
        user_id: &str,
        text: &str,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        if commands::parse_edit_end(text) {
            if matches!(self.sessions.state(user_id), Some(UserState::Editing(_))) {
                self.sessions.clear_state(user_id);
            }
            self.notify(reply_token, user_id, "✅ 編集モードを終了しました。").await;
            return Ok(());
        }
        if commands::parse_edit_cancel(text) {
            if matches!(self.sessions.state(user_id), Some(UserState::Editing(_))) {
                self.sessions.clear_state(user_id);
            }
            self.notify(reply_token, user_id, "🟡 編集をキャンセルしました。").await;
            return Ok(());
        }

        if let Some(edit_id) = commands::parse_edit_start(text) {
            return self.start_edit(user_id, edit_id, reply_token).await;
        }

        if let Some(UserState::Editing(session)) = self.sessions.state(user_id) {
            if let Some(update) = commands::parse_field_update(text) {
                return self.apply_field_update(user_id, session, update, reply_token).await;
            }
        }

        if let Some(ids) = commands::parse_delete_ids(text) {
            let toggled = self.db.soft_delete_many(&ids)?;
            let listed: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            self.notify(
                reply_token,
                user_id,
                &format!(
                    "🗑️ 非表示にしました：{toggled}/{} 件\n({})",
                    ids.len(),
                    listed.join(", ")
                ),
            )
            .await;
            return Ok(());
        }

        if let Some(next_type) = commands::parse_next_type(text) {
            self.sessions.set_next_type(user_id, next_type);
            self.notify(
                reply_token,
                user_id,
                &format!(
                    "✅ 次の画像の行き先を {} に確定しました。続けて画像を送ってください。",
                    next_type.label()
                ),
            )
            .await;
            return Ok(());
        }

        // Type-only commands and OK confirmation only mean something while
        // an image is pending; otherwise they fall through as plain text.
        if let Some(UserState::PendingImage(pending)) = self.sessions.state(user_id) {
            if let Some(cmd) = commands::parse_type_only_command(text) {
                return self.handle_pending_image_command(user_id, pending, cmd, reply_token).await;
            }
        }

        self.submit_text_post(user_id, text, reply_token).await
    }

    async fn start_edit(
        &self,
        user_id: &str,
        edit_id: i64,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        let Some(post) = self.db.get_post(edit_id) else {
            self.notify(
                reply_token,
                user_id,
                &format!("⚠️ ID:{edit_id} が見つかりませんでした。"),
            )
            .await;
            return Ok(());
        };

        self.sessions.set_state(
            user_id,
            UserState::Editing(EditingSession { id: post.id, post_type: post.post_type }),
        );

        let text = format!(
            "✏️ 編集モード (ID:{} / {})\n\nDATE:\n{}\n\nJA:\n{}\n\nEN:\n{}\n\n修正はこう送ってください：\nDATE: YYYY.MM.DD / JA: ... / EN: ... / BTNJA: ... / BTNEN: ... / TYPE: news|voice|archive\n終わるとき：完了　やめる：取消",
            post.id,
            post.post_type.label(),
            post.date,
            post.ja_html,
            post.en_html
        );
        self.notify(reply_token, user_id, &text).await;
        Ok(())
    }

    async fn apply_field_update(
        &self,
        user_id: &str,
        session: EditingSession,
        update: commands::FieldUpdate,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        let Some(post) = self.db.get_post(session.id) else {
            self.sessions.clear_state(user_id);
            self.notify(
                reply_token,
                user_id,
                "⚠️ 対象が消えました。編集モードを解除しました。",
            )
            .await;
            return Ok(());
        };

        let changed = match update.field {
            EditField::Type => {
                let Some(new_type) = PostType::parse(&update.value) else {
                    self.notify(reply_token, user_id, "⚠️ TYPE は news|voice|archive のみです。")
                        .await;
                    return Ok(());
                };

                // A TYPE change re-derives the display date and re-wraps
                // both bodies under the new type's formatting rule.
                let view_date = view_date_from_padded(post.date.trim());
                let (ja, en, image_kind) = if new_type == PostType::Voice {
                    let ja = wrap_if_voice_span(PostType::Voice, &post.ja_html);
                    let en_src =
                        if post.en_html.is_empty() { post.ja_html.clone() } else { post.en_html.clone() };
                    let en = wrap_if_voice_span(PostType::Voice, &en_src);
                    let kind = post.image_src.as_ref().map(|_| "voice".to_string());
                    (ja, en, kind)
                } else {
                    (post.ja_html.clone(), post.en_html.clone(), None)
                };

                let changed = self.db.update_fields(
                    post.id,
                    &[
                        ("type", Some(new_type.as_str().to_string())),
                        ("view_date", Some(view_date)),
                        ("ja_html", Some(ja)),
                        ("en_html", Some(en)),
                        ("image_kind", image_kind),
                    ],
                )?;
                if changed {
                    self.sessions.set_state(
                        user_id,
                        UserState::Editing(EditingSession { id: post.id, post_type: new_type }),
                    );
                }
                changed
            }
            EditField::Date => {
                let Some(date) = extract_date_padded(&update.value) else {
                    self.notify(
                        reply_token,
                        user_id,
                        "⚠️ DATE は YYYY.MM.DD（または 2/8 形式）で送ってください。",
                    )
                    .await;
                    return Ok(());
                };
                let view_date = view_date_from_padded(&date);
                self.db.update_fields(
                    post.id,
                    &[("date", Some(date)), ("view_date", Some(view_date))],
                )?
            }
            EditField::Ja => {
                let value = wrap_if_voice_span(post.post_type, &update.value);
                self.db.update_fields(post.id, &[("ja_html", Some(value))])?
            }
            EditField::En => {
                let value = wrap_if_voice_span(post.post_type, &update.value);
                self.db.update_fields(post.id, &[("en_html", Some(value))])?
            }
            EditField::BtnJa => {
                self.db.update_fields(post.id, &[("ja_link_text", Some(update.value.clone()))])?
            }
            EditField::BtnEn => {
                self.db.update_fields(post.id, &[("en_link_text", Some(update.value.clone()))])?
            }
        };

        let text = if changed {
            format!("✅ {} を更新しました (ID:{})", update.field.as_str(), post.id)
        } else {
            format!("⚠️ 更新できませんでした (ID:{})", post.id)
        };
        self.notify(reply_token, user_id, &text).await;
        Ok(())
    }

    async fn handle_pending_image_command(
        &self,
        user_id: &str,
        mut pending: PendingImage,
        cmd: TypeOnlyCommand,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        match cmd {
            TypeOnlyCommand::Type(post_type) => {
                pending.forced_type = Some(post_type);
                self.sessions.set_state(user_id, UserState::PendingImage(pending));
                self.notify(
                    reply_token,
                    user_id,
                    &format!(
                        "✅ 種別を {} に設定しました。続けて「OK」で投稿、または本文で上書きしてください。",
                        post_type.label()
                    ),
                )
                .await;
                Ok(())
            }
            TypeOnlyCommand::Ok => {
                let Some(generated) = pending.generated.clone() else {
                    self.notify(
                        reply_token,
                        user_id,
                        "⚠️ 自動投稿用の下書きがありません。本文（に:/N:/A:/あ:/V:）を送ってください。",
                    )
                    .await;
                    return Ok(());
                };

                let post_type = pending.forced_type.unwrap_or(generated.post_type);
                let date = generated.date.clone();
                let post = build_image_post(post_type, &date, &generated, &pending.image_src);
                let id = self.db.upsert_post(&post)?;
                self.sessions.clear_state(user_id);

                self.notify(
                    reply_token,
                    user_id,
                    &format!("✅ 投稿しました (ID:{id})\n[{}] date={date}", post_type.label()),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn submit_text_post(
        &self,
        user_id: &str,
        text: &str,
        reply_token: Option<&str>,
    ) -> Result<(), String> {
        let detected = commands::detect_type_and_content(text);
        let mut post_type = detected.post_type;
        let content = detected.content;

        // A pending image whose destination was fixed by NEXT:/T: wins over
        // the default, but an explicit prefix in the body wins over both.
        let state = self.sessions.state(user_id);
        if let Some(UserState::PendingImage(p)) = &state {
            if let Some(forced) = p.forced_type {
                if !detected.explicit {
                    post_type = forced;
                }
            }
        }

        let date = extract_date_padded(&content).unwrap_or_else(today_jst_padded);
        let url_in_text = extract_url(&content);
        let content_no_url = match &url_in_text {
            Some(url) => content.replace(url, "").trim().to_string(),
            None => content.clone(),
        };

        let copy = self.copy.generate(&content_no_url, post_type == PostType::News).await;

        let pending_image_src = self.sessions.take_pending_image(user_id).map(|p| p.image_src);

        let mut media_type = "image".to_string();
        let mut media_src = None;
        let mut poster_src = None;
        if let Some(UserState::PendingVideo(v)) = &state {
            if v.stage == VideoStage::AwaitText {
                if let Some(poster) = &v.poster_key {
                    media_type = "video".to_string();
                    media_src = Some(v.video_key.clone());
                    poster_src = Some(poster.clone());
                    self.sessions.clear_state(user_id);
                }
            }
        }

        let mut ja_html = copy.ja.clone();
        let mut en_html = copy.en.clone();
        let mut ja_link_text = String::new();
        let mut en_link_text = String::new();
        let mut ja_link_href = String::new();
        let mut en_link_href = String::new();
        let mut image_kind = None;
        let view_date = view_date_from_padded(&date);

        match post_type {
            PostType::News => {
                if let Some(url) = &url_in_text {
                    ja_link_text = if copy.btn_ja.is_empty() {
                        DEFAULT_BTN_JA.to_string()
                    } else {
                        copy.btn_ja.clone()
                    };
                    en_link_text = if copy.btn_en.is_empty() {
                        DEFAULT_BTN_EN.to_string()
                    } else {
                        copy.btn_en.clone()
                    };
                    ja_link_href = url.clone();
                    en_link_href = url.clone();
                }
            }
            PostType::Archive => {}
            PostType::Voice => {
                ja_html = wrap_if_voice_span(PostType::Voice, &copy.ja);
                let en_src = if copy.en.is_empty() { copy.ja.clone() } else { copy.en.clone() };
                en_html = wrap_if_voice_span(PostType::Voice, &en_src);
                image_kind = pending_image_src.as_ref().map(|_| "voice".to_string());
            }
        }

        let hash_source = match post_type {
            PostType::News if !ja_link_href.is_empty() => ja_link_href.clone(),
            _ => content_no_url.clone(),
        };

        let post = NewPost {
            post_type,
            date: date.clone(),
            view_date: Some(view_date),
            ja_html,
            en_html,
            ja_link_text,
            ja_link_href,
            en_link_text,
            en_link_href,
            image_src: pending_image_src,
            image_kind,
            media_type,
            media_src,
            poster_src,
            legacy_key: legacy_key(post_type, &date, &hash_source),
        };

        let id = self.db.upsert_post(&post)?;

        let preview: String = content_no_url.chars().take(20).collect();
        let ellipsis = if content_no_url.chars().count() > 20 { "..." } else { "" };
        self.notify(
            reply_token,
            user_id,
            &format!("✅ 更新完了 (ID: {id})\n[{}] {preview}{ellipsis}", post_type.label()),
        )
        .await;
        Ok(())
    }
}

/// Build the post row for a classified image (auto-post and OK paths share
/// this).
fn build_image_post(
    post_type: PostType,
    date: &str,
    generated: &VisionPost,
    image_src: &str,
) -> NewPost {
    let mut ja_html = generated.ja_html.clone();
    let mut en_html = generated.en_html.clone();
    let mut image_kind = None;

    if post_type == PostType::News {
        ja_html = add_news_suffix_to_first_line(&ja_html, NEWS_FIRST_LINE_SUFFIX);
    }
    if post_type == PostType::Voice {
        ja_html = wrap_if_voice_span(PostType::Voice, &ja_html);
        let en_src = if en_html.is_empty() { ja_html.clone() } else { en_html };
        en_html = wrap_if_voice_span(PostType::Voice, &en_src);
        image_kind = Some("voice".to_string());
    }

    let hash_source = format!("{image_src}:{ja_html}");

    NewPost {
        post_type,
        date: date.to_string(),
        view_date: Some(view_date_from_padded(date)),
        ja_html,
        en_html,
        ja_link_text: String::new(),
        ja_link_href: String::new(),
        en_link_text: String::new(),
        en_link_href: String::new(),
        image_src: Some(image_src.to_string()),
        image_kind,
        media_type: "image".to_string(),
        media_src: None,
        poster_src: None,
        legacy_key: legacy_key(post_type, date, &hash_source),
    }
}

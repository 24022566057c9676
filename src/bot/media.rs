//! Media intake: storage destinations for inbound attachments.
//!
//! Small images go to a version-controlled asset host so the site can serve
//! them alongside its sources; large images and all video go to the blob
//! store under date/user/message-partitioned keys.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use tracing::info;

use crate::bot::dates::{today_jst_yyyymm, today_jst_yyyymmdd};

/// Blob object category, the first key segment after `media/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Poster,
}

impl MediaKind {
    fn segment(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Poster => "poster",
        }
    }
}

/// File extension from a content type; anything unrecognized is jpg.
pub fn ext_from_content_type(ct: &str) -> &'static str {
    let s = ct.to_lowercase();
    if s.contains("png") {
        "png"
    } else if s.contains("webp") {
        "webp"
    } else if s.contains("gif") {
        "gif"
    } else if s.contains("mp4") || s.contains("video") {
        "mp4"
    } else {
        "jpg"
    }
}

/// Key layout: `media/{kind}/{yyyymm}/{userId}/{messageId}.{ext}`.
pub fn blob_key(kind: MediaKind, user_id: &str, message_id: &str, ext: &str) -> String {
    format!(
        "media/{}/{}/{}/{}.{}",
        kind.segment(),
        today_jst_yyyymm(),
        user_id,
        message_id,
        ext
    )
}

/// Directory-rooted blob store. Objects are addressed by their full key and
/// served back verbatim by the `/media/{key}` route.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, String> {
        // Keys are generated internally, but the serving route passes
        // user-supplied keys through here as well.
        if key.is_empty() || key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(format!("invalid blob key: {key}"));
        }
        Ok(self.root.join(key))
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("blob mkdir failed: {e}"))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| format!("blob write failed: {e}"))?;
        info!(target: "db", key, size = bytes.len(), "stored blob");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("blob read failed: {e}")),
        }
    }
}

/// Upload seam for the version-controlled asset host.
#[async_trait]
pub trait AssetHost: Send + Sync {
    /// Stores an image and returns the generated filename.
    async fn upload_image(
        &self,
        bytes: &[u8],
        content_type: &str,
        message_id: &str,
    ) -> Result<String, String>;
}

/// GitHub contents-API asset host: a PUT per file with base64 content, a
/// commit message, and a target branch.
pub struct GitHubAssetHost {
    owner: String,
    repo: String,
    branch: String,
    token: String,
    http: reqwest::Client,
}

impl GitHubAssetHost {
    pub fn new(
        owner: String,
        repo: String,
        branch: String,
        token: String,
        timeout: std::time::Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self { owner, repo, branch, token, http }
    }
}

/// Generated filename: `voice_{yyyymmdd}_{messageId}_{rand}.{ext}`.
fn asset_filename(message_id: &str, content_type: &str) -> String {
    let ext = ext_from_content_type(content_type);
    let date = today_jst_yyyymmdd();
    let suffix: u32 = rand::rng().random_range(0..1000);
    format!("voice_{date}_{message_id}_{suffix}.{ext}")
}

#[async_trait]
impl AssetHost for GitHubAssetHost {
    async fn upload_image(
        &self,
        bytes: &[u8],
        content_type: &str,
        message_id: &str,
    ) -> Result<String, String> {
        if self.token.is_empty() {
            return Err("missing asset host token".to_string());
        }

        let filename = asset_filename(message_id, content_type);
        let url = format!(
            "https://api.github.com/repos/{}/{}/contents/images/{}",
            self.owner, self.repo, filename
        );
        let body = serde_json::json!({
            "message": format!("Upload {filename} from LINE"),
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
            "branch": self.branch,
        });

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "kurogo")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("asset upload failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let t = response.text().await.unwrap_or_default();
            let preview: String = t.chars().take(400).collect();
            return Err(format!("asset upload failed: {status} {preview}"));
        }

        info!(target: "db", %filename, size = bytes.len(), "uploaded asset");
        Ok(filename)
    }
}

/// Where an inbound image was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredImage {
    /// Asset host filename; small enough to have been classified.
    Asset(String),
    /// Blob store key; too large for the asset host, classification skipped.
    Blob(String),
}

impl StoredImage {
    pub fn src(&self) -> &str {
        match self {
            StoredImage::Asset(name) => name,
            StoredImage::Blob(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext_from_content_type() {
        assert_eq!(ext_from_content_type("image/png"), "png");
        assert_eq!(ext_from_content_type("IMAGE/WEBP"), "webp");
        assert_eq!(ext_from_content_type("image/gif"), "gif");
        assert_eq!(ext_from_content_type("video/mp4"), "mp4");
        assert_eq!(ext_from_content_type("image/jpeg"), "jpg");
        assert_eq!(ext_from_content_type(""), "jpg");
    }

    #[test]
    fn test_blob_key_layout() {
        let key = blob_key(MediaKind::Video, "U123", "m456", "mp4");
        let yyyymm = today_jst_yyyymm();
        assert_eq!(key, format!("media/video/{yyyymm}/U123/m456.mp4"));
    }

    #[test]
    fn test_asset_filename_shape() {
        let name = asset_filename("m789", "image/png");
        let date = today_jst_yyyymmdd();
        assert!(name.starts_with(&format!("voice_{date}_m789_")));
        assert!(name.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_blob_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf());

        let key = blob_key(MediaKind::Image, "U1", "m1", "jpg");
        store.put(&key, b"bytes").await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"bytes"[..]));
        assert_eq!(store.get("media/image/unknown/x.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blob_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf());

        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("media/../../x", b"x").await.is_err());
        assert!(store.get("").await.is_err());
    }
}

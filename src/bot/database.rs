//! Persistent SQLite content store for posts.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::bot::commands::PostType;

/// A stored content item.
#[derive(Debug, Clone)]
pub struct Post {
    pub id: i64,
    pub post_type: PostType,
    pub date: String,
    pub view_date: Option<String>,
    pub ja_html: String,
    pub en_html: String,
    pub ja_link_text: String,
    pub ja_link_href: String,
    pub en_link_text: String,
    pub en_link_href: String,
    pub image_src: Option<String>,
    pub image_kind: Option<String>,
    pub media_type: String,
    pub media_src: Option<String>,
    pub poster_src: Option<String>,
    pub enabled: bool,
    pub legacy_key: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Row content for an upsert; the store assigns `id` and timestamps.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub post_type: PostType,
    pub date: String,
    pub view_date: Option<String>,
    pub ja_html: String,
    pub en_html: String,
    pub ja_link_text: String,
    pub ja_link_href: String,
    pub en_link_text: String,
    pub en_link_href: String,
    pub image_src: Option<String>,
    pub image_kind: Option<String>,
    pub media_type: String,
    pub media_src: Option<String>,
    pub poster_src: Option<String>,
    pub legacy_key: String,
}

/// Idempotency key for upsert conflict resolution.
///
/// Archive posts key on the date alone, so one archive row exists per date.
/// News/voice combine the date with a truncated content hash: literal
/// re-submission collapses to one row, distinct content on the same date
/// stays distinct. Anything else gets a random suffix and is deliberately
/// not idempotent.
pub fn legacy_key(post_type: PostType, date: &str, content_or_url: &str) -> String {
    match post_type {
        PostType::Archive if !date.is_empty() => format!("archive:date:{date}"),
        PostType::News | PostType::Voice => {
            let hash = hex::encode(Sha1::digest(content_or_url.as_bytes()));
            format!("{}:{}:{}", post_type.as_str(), date, &hash[..10])
        }
        _ => format!("{}:{}:{}", post_type.as_str(), date, uuid::Uuid::new_v4()),
    }
}

const POST_COLUMNS: &str = "id, type, date, view_date, ja_html, en_html, \
     ja_link_text, ja_link_href, en_link_text, en_link_href, \
     image_src, image_kind, media_type, media_src, poster_src, \
     enabled, legacy_key, created_at, updated_at";

/// Columns a partial update may touch.
const UPDATABLE_COLUMNS: [&str; 9] = [
    "type", "date", "view_date", "ja_html", "en_html", "ja_link_text",
    "en_link_text", "image_kind", "enabled",
];

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create an in-memory store.
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema();
        db
    }

    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema();

        let count: i64 = db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))
            .unwrap_or(0);
        info!(target: "db", "loaded content store from {:?} ({} posts)", path, count);

        db
    }

    fn init_schema(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                date TEXT NOT NULL,
                view_date TEXT,
                ja_html TEXT NOT NULL DEFAULT '',
                en_html TEXT NOT NULL DEFAULT '',
                ja_link_text TEXT NOT NULL DEFAULT '',
                ja_link_href TEXT NOT NULL DEFAULT '',
                en_link_text TEXT NOT NULL DEFAULT '',
                en_link_href TEXT NOT NULL DEFAULT '',
                image_src TEXT,
                image_kind TEXT,
                media_type TEXT NOT NULL DEFAULT 'image',
                media_src TEXT,
                poster_src TEXT,
                enabled TEXT NOT NULL DEFAULT 'TRUE',
                legacy_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_posts_type ON posts(type);
            CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
            "#,
        )
        .expect("Failed to initialize database schema");
    }

    /// Idempotent upsert on `legacy_key`: insert a new row, or overwrite all
    /// mutable columns of the existing one while keeping its id and
    /// creation timestamp. Returns the row id.
    pub fn upsert_post(&self, post: &NewPost) -> Result<i64, String> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO posts
              (type, date, view_date, ja_html, en_html,
               ja_link_text, ja_link_href, en_link_text, en_link_href,
               image_src, image_kind, media_type, media_src, poster_src,
               enabled, legacy_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'TRUE', ?15, datetime('now'))
            ON CONFLICT(legacy_key) DO UPDATE SET
              type         = excluded.type,
              date         = excluded.date,
              view_date    = excluded.view_date,
              ja_html      = excluded.ja_html,
              en_html      = excluded.en_html,
              ja_link_text = excluded.ja_link_text,
              ja_link_href = excluded.ja_link_href,
              en_link_text = excluded.en_link_text,
              en_link_href = excluded.en_link_href,
              image_src    = excluded.image_src,
              image_kind   = excluded.image_kind,
              media_type   = excluded.media_type,
              media_src    = excluded.media_src,
              poster_src   = excluded.poster_src,
              enabled      = excluded.enabled,
              updated_at   = datetime('now')
            "#,
            params![
                post.post_type.as_str(),
                post.date,
                post.view_date,
                post.ja_html,
                post.en_html,
                post.ja_link_text,
                post.ja_link_href,
                post.en_link_text,
                post.en_link_href,
                post.image_src,
                post.image_kind,
                post.media_type,
                post.media_src,
                post.poster_src,
                post.legacy_key,
            ],
        )
        .map_err(|e| format!("upsert failed: {e}"))?;

        let id: i64 = conn
            .query_row(
                "SELECT id FROM posts WHERE legacy_key = ?1 LIMIT 1",
                params![post.legacy_key],
                |row| row.get(0),
            )
            .map_err(|e| format!("upsert id lookup failed: {e}"))?;

        info!(target: "db", id, post_type = post.post_type.as_str(), date = %post.date, "upserted post");
        Ok(id)
    }

    pub fn get_post(&self, id: i64) -> Option<Post> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1 LIMIT 1"),
            params![id],
            row_to_post,
        )
        .ok()
    }

    /// Apply a sparse field update. Column names outside the updatable set
    /// are rejected. Returns whether a row was changed.
    pub fn update_fields(
        &self,
        id: i64,
        fields: &[(&str, Option<String>)],
    ) -> Result<bool, String> {
        if fields.is_empty() {
            return Ok(false);
        }
        for (column, _) in fields {
            if !UPDATABLE_COLUMNS.contains(column) {
                return Err(format!("column not updatable: {column}"));
            }
        }

        let set_sql: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE posts SET {}, updated_at = datetime('now') WHERE id = ?{}",
            set_sql.join(", "),
            fields.len() + 1
        );

        let mut values: Vec<&dyn rusqlite::ToSql> =
            fields.iter().map(|(_, v)| v as &dyn rusqlite::ToSql).collect();
        values.push(&id);

        let conn = self.conn.lock().unwrap();
        let changes = conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| format!("update failed: {e}"))?;

        Ok(changes > 0)
    }

    /// Soft-delete a batch of ids, returning how many rows were actually
    /// toggled. Missing and already-disabled ids are tolerated.
    pub fn soft_delete_many(&self, ids: &[i64]) -> Result<usize, String> {
        let conn = self.conn.lock().unwrap();
        let mut toggled = 0;
        for id in ids {
            let changes = conn
                .execute(
                    "UPDATE posts SET enabled = 'FALSE', updated_at = datetime('now') \
                     WHERE id = ?1 AND enabled <> 'FALSE'",
                    params![id],
                )
                .unwrap_or_else(|e| {
                    warn!(target: "db", id, "soft delete failed: {e}");
                    0
                });
            if changes > 0 {
                toggled += 1;
            }
        }
        info!(target: "db", toggled, requested = ids.len(), "soft deleted posts");
        Ok(toggled)
    }

    /// Paginated, type-filtered listing for the read API.
    ///
    /// Voice posts come back in insertion order (newest first). News and
    /// archive posts order by a separator-stripped date key, longest first
    /// so fully-dated rows outrank partial legacy dates, then by the key
    /// itself, then id.
    pub fn list_posts(
        &self,
        post_type: PostType,
        only_enabled: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>, String> {
        let flag_sql = if only_enabled { " AND enabled = 'TRUE'" } else { "" };

        let date_key =
            "REPLACE(REPLACE(REPLACE(REPLACE(date,'.',''),'/',''),' ',''),':','')";
        let order_sql = match post_type {
            PostType::Voice => "ORDER BY created_at DESC, id DESC".to_string(),
            _ => format!("ORDER BY LENGTH({date_key}) DESC, {date_key} DESC, id DESC"),
        };

        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE type = ?1{flag_sql} {order_sql} LIMIT ?2 OFFSET ?3"
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql).map_err(|e| format!("query error: {e}"))?;
        let rows = stmt
            .query_map(params![post_type.as_str(), limit, offset], row_to_post)
            .map_err(|e| format!("query error: {e}"))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let type_str: String = row.get(1)?;
    let enabled: String = row.get(15)?;
    Ok(Post {
        id: row.get(0)?,
        post_type: PostType::parse(&type_str).unwrap_or(PostType::Voice),
        date: row.get(2)?,
        view_date: row.get(3)?,
        ja_html: row.get(4)?,
        en_html: row.get(5)?,
        ja_link_text: row.get(6)?,
        ja_link_href: row.get(7)?,
        en_link_text: row.get(8)?,
        en_link_href: row.get(9)?,
        image_src: row.get(10)?,
        image_kind: row.get(11)?,
        media_type: row.get(12)?,
        media_src: row.get(13)?,
        poster_src: row.get(14)?,
        enabled: enabled == "TRUE",
        legacy_key: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

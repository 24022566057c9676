//! Free-text command parsers.
//!
//! Every parser here is a pure matcher: it inspects the message text and
//! returns a typed result or `None`. The engine decides, based on the
//! user's conversation state, which matches actually apply.

use std::sync::LazyLock;

use regex::Regex;

/// Destination type of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostType {
    News,
    Voice,
    Archive,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::News => "news",
            PostType::Voice => "voice",
            PostType::Archive => "archive",
        }
    }

    /// Exact lowercase type word, e.g. from the TYPE edit field.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "news" => Some(PostType::News),
            "voice" => Some(PostType::Voice),
            "archive" => Some(PostType::Archive),
            _ => None,
        }
    }

    /// Uppercase label for reply messages.
    pub fn label(&self) -> String {
        self.as_str().to_uppercase()
    }
}

/// Result of prefix detection on a free-text submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeAndContent {
    pub post_type: PostType,
    pub content: String,
    /// True when the type came from an explicit prefix rather than default.
    pub explicit: bool,
}

static NEWS_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(ニュース|ニュース：|N：|N:|に：|に:)").unwrap());
static ARCHIVE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(アーカイブ|アーカイブ：|A：|A:|あ：|あ:)").unwrap());
static VOICE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(V：|V:|v：|v:|ボイス|voice|VOICE)[:：\s]").unwrap());
static STRIP_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(ニュース|アーカイブ|ボイス|VOICE|voice|ニュース：|アーカイブ：|N：|A：|V：|N:|A:|V:|に：|あ：|に:|あ:|v：|v:)\s*[:：]?\s*",
    )
    .unwrap()
});

/// Detect the destination type from a localized/ASCII prefix and strip it.
/// No prefix means `voice` with `explicit = false`.
pub fn detect_type_and_content(text: &str) -> TypeAndContent {
    let t = text.trim();

    let (post_type, explicit) = if NEWS_PREFIX_RE.is_match(t) {
        (PostType::News, true)
    } else if ARCHIVE_PREFIX_RE.is_match(t) {
        (PostType::Archive, true)
    } else if VOICE_PREFIX_RE.is_match(t) {
        (PostType::Voice, true)
    } else {
        (PostType::Voice, false)
    };

    let content = STRIP_PREFIX_RE.replace(t, "").trim().to_string();

    TypeAndContent { post_type, content, explicit }
}

/// A bare type/confirmation command, valid only while an image is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOnlyCommand {
    Type(PostType),
    Ok,
}

static TYPE_ONLY_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:T|TYPE|種別)\s*[:：]\s*(news|voice|archive)\s*$").unwrap()
});
static TYPE_ONLY_JA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:T|TYPE|種別)\s*[:：]\s*(ニュース|ボイス|アーカイブ)\s*$").unwrap()
});
static OK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(ok|投稿|確定)$").unwrap());

/// `T:`/`TYPE:`/`種別:` destination command, or a bare confirmation token.
pub fn parse_type_only_command(text: &str) -> Option<TypeOnlyCommand> {
    let s = text.trim();

    if let Some(caps) = TYPE_ONLY_EN_RE.captures(s) {
        return PostType::parse(&caps[1]).map(TypeOnlyCommand::Type);
    }
    if let Some(caps) = TYPE_ONLY_JA_RE.captures(s) {
        let word = &caps[1];
        let t = if word.contains("ニュー") {
            PostType::News
        } else if word.contains("アーカ") {
            PostType::Archive
        } else {
            PostType::Voice
        };
        return Some(TypeOnlyCommand::Type(t));
    }
    if OK_RE.is_match(s) {
        return Some(TypeOnlyCommand::Ok);
    }
    None
}

static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(削除|消去|さ)\s*[:：]\s*(?:id\s*[:：]\s*)?(.+)$").unwrap()
});
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)$").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NON_DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^0-9]").unwrap());

/// Delete verb followed by a single id, an id list, or an inclusive range.
/// Returns a deduplicated id list, or `None` when no valid id parses.
pub fn parse_delete_ids(text: &str) -> Option<Vec<i64>> {
    let cleaned: String = text.chars().filter(|c| !"「」『』\"".contains(*c)).collect();
    let s = WS_RE.replace_all(cleaned.trim(), " ").to_string();

    let caps = DELETE_RE.captures(&s)?;
    let rest = caps[2].trim().to_string();

    if let Some(r) = RANGE_RE.captures(&rest) {
        let a: i64 = r[1].parse().ok()?;
        let b: i64 = r[2].parse().ok()?;
        let (lo, hi) = (a.min(b), a.max(b));
        return Some((lo..=hi).collect());
    }

    let mut ids: Vec<i64> = Vec::new();
    for part in rest.split([',', ' ']).filter(|p| !p.is_empty()) {
        let digits = NON_DIGIT_RE.replace_all(part, "");
        if let Ok(n) = digits.parse::<i64>() {
            if n > 0 && !ids.contains(&n) {
                ids.push(n);
            }
        }
    }

    if ids.is_empty() { None } else { Some(ids) }
}

static EDIT_START_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^編集[:：](\d+)$").unwrap());
static EDIT_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(完了|終了|end)$").unwrap());
static EDIT_CANCEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(取消|キャンセル|中止|cancel)$").unwrap());

/// `編集:<id>` opens an edit session on the given post id.
pub fn parse_edit_start(text: &str) -> Option<i64> {
    let s: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    EDIT_START_RE.captures(&s)?[1].parse().ok()
}

pub fn parse_edit_end(text: &str) -> bool {
    EDIT_END_RE.is_match(text.trim())
}

pub fn parse_edit_cancel(text: &str) -> bool {
    EDIT_CANCEL_RE.is_match(text.trim())
}

/// Field updated by a `FIELD: value` message inside an edit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    Ja,
    En,
    BtnJa,
    BtnEn,
    Type,
    Date,
}

impl EditField {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditField::Ja => "JA",
            EditField::En => "EN",
            EditField::BtnJa => "BTNJA",
            EditField::BtnEn => "BTNEN",
            EditField::Type => "TYPE",
            EditField::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: EditField,
    pub value: String,
}

static FIELD_UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(JA|EN|BTNJA|BTNEN|TYPE|DATE)\s*[:：]\s*(.+)$").unwrap()
});

/// `FIELD: value` inside an edit session.
pub fn parse_field_update(text: &str) -> Option<FieldUpdate> {
    let caps = FIELD_UPDATE_RE.captures(text.trim())?;
    let field = match caps[1].to_uppercase().as_str() {
        "JA" => EditField::Ja,
        "EN" => EditField::En,
        "BTNJA" => EditField::BtnJa,
        "BTNEN" => EditField::BtnEn,
        "TYPE" => EditField::Type,
        "DATE" => EditField::Date,
        _ => return None,
    };
    Some(FieldUpdate { field, value: caps[2].trim().to_string() })
}

/// Normalize a localized type word (`ニュース`, `アーカイブ`, `ボイス`, or
/// the english words) to a canonical type.
pub fn normalize_type_word(raw: &str) -> Option<PostType> {
    let t = raw.trim().to_lowercase();
    if let Some(p) = PostType::parse(&t) {
        return Some(p);
    }
    if t.contains("ニュー") {
        Some(PostType::News)
    } else if t.contains("アーカ") {
        Some(PostType::Archive)
    } else if t.contains("ボイ") || t.contains("voice") {
        Some(PostType::Voice)
    } else {
        None
    }
}

static NEXT_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^NEXT\s*[:：]\s*(.+)$").unwrap());

/// `NEXT:<type-word>` pre-declares the destination of the next image.
pub fn parse_next_type(text: &str) -> Option<PostType> {
    let caps = NEXT_TYPE_RE.captures(text.trim())?;
    normalize_type_word(&caps[1])
}

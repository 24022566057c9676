//! HTML-safety helpers for post bodies.
//!
//! Voice posts are stored wrapped in a single `<span>`; news/archive bodies
//! are stored as-is with `<br>` line breaks.

use std::sync::LazyLock;

use regex::Regex;

use crate::bot::commands::PostType;

/// Fixed suffix appended to the first line of auto-posted news bodies.
pub const NEWS_FIRST_LINE_SUFFIX: &str = "に出演します。";

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

static SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^<span>.*</span>$").unwrap());
static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());

/// Normalize voice text into `<span>line<br>line</span>` form.
/// Already-wrapped input is left untouched.
pub fn normalize_voice_text_to_html(s: &str) -> String {
    let t = s.replace("\r\n", "\n").replace('\r', "\n");
    let t = t.trim();
    if SPAN_RE.is_match(t) {
        return t.to_string();
    }

    let safe: Vec<String> = BR_RE
        .split(t)
        .flat_map(|part| part.split('\n'))
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(escape_html)
        .collect();

    format!("<span>{}</span>", safe.join("<br>"))
}

/// Wrap voice bodies in a `<span>`; other types pass through trimmed.
pub fn wrap_if_voice_span(post_type: PostType, html_or_text: &str) -> String {
    if post_type == PostType::Voice {
        normalize_voice_text_to_html(html_or_text)
    } else {
        html_or_text.trim().to_string()
    }
}

/// Convert newlines to `<br>`, dropping empty lines.
pub fn nl2br(s: &str) -> String {
    s.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .collect::<Vec<_>>()
        .join("<br>")
}

static APPEARANCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"出演(し|い)ます|出演予定|出演致|出演いた").unwrap());

/// Append the fixed appearance suffix to the first `<br>`-separated line of
/// a news body. Idempotent: skipped when the first line already carries an
/// appearance phrase. Remaining lines are untouched.
pub fn add_news_suffix_to_first_line(html: &str, suffix: &str) -> String {
    let raw = html.trim();
    if raw.is_empty() {
        return raw.to_string();
    }

    let mut parts: Vec<String> = BR_RE.split(raw).map(|p| p.to_string()).collect();
    let first = parts[0].trim().to_string();
    let first = if APPEARANCE_RE.is_match(&first) {
        first
    } else {
        format!("{first}{suffix}")
    };
    parts[0] = first;

    parts
        .into_iter()
        .filter(|x| !x.trim().is_empty())
        .collect::<Vec<_>>()
        .join("<br>")
}

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[\w!?/+\-_~=;.,*&@#$%()'\[\]]+").unwrap()
});

/// First well-formed `http(s)` token in the text, if any.
pub fn extract_url(content: &str) -> Option<String> {
    URL_RE.find(content).map(|m| m.as_str().to_string())
}

//! Date helpers. All "today" computations use JST (fixed +9h offset).

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use regex::Regex;

const JST_OFFSET_SECS: i32 = 9 * 60 * 60;

fn jst_now() -> DateTime<FixedOffset> {
    let jst = FixedOffset::east_opt(JST_OFFSET_SECS).expect("valid JST offset");
    Utc::now().with_timezone(&jst)
}

/// Today's date in JST as zero-padded `YYYY.MM.DD`.
pub fn today_jst_padded() -> String {
    let now = jst_now();
    format!("{:04}.{:02}.{:02}", now.year(), now.month(), now.day())
}

/// Today's JST date as `yyyymm`, used for storage key partitioning.
pub fn today_jst_yyyymm() -> String {
    let now = jst_now();
    format!("{:04}{:02}", now.year(), now.month())
}

/// Today's JST date as `yyyymmdd`, used in generated filenames.
pub fn today_jst_yyyymmdd() -> String {
    today_jst_padded().replace('.', "")
}

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:(\d{4})[./年])?(\d{1,2})[./月](\d{1,2})日?").unwrap());

/// Extract the first date from free text (`Y.M.D`, `Y/M/D`, or kanji
/// month/day). A missing year defaults to the current JST year. Output is
/// always zero-padded `YYYY.MM.DD`.
pub fn extract_date_padded(content: &str) -> Option<String> {
    let caps = DATE_RE.captures(content)?;
    let year = match caps.get(1) {
        Some(y) => y.as_str().to_string(),
        None => jst_now().year().to_string(),
    };
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    Some(format!("{year}.{month:02}.{day:02}"))
}

static PADDED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})\.(\d{2})\.(\d{2})$").unwrap());

/// Display variant of a padded date: `YYYY.MM.DD` -> `YYYY.M.D`.
/// Anything that is not a padded date passes through unchanged.
pub fn view_date_from_padded(padded: &str) -> String {
    match PADDED_RE.captures(padded) {
        Some(caps) => {
            let y = &caps[1];
            let m: u32 = caps[2].parse().unwrap_or(0);
            let d: u32 = caps[3].parse().unwrap_or(0);
            format!("{y}.{m}.{d}")
        }
        None => padded.to_string(),
    }
}

/// Keep a padded date as-is, otherwise fall back to today (JST).
pub fn padded_date_or_today(date: &str) -> String {
    if PADDED_RE.is_match(date) {
        date.to_string()
    } else {
        today_jst_padded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_full_date() {
        assert_eq!(
            extract_date_padded("公演は2026.3.7に開催").as_deref(),
            Some("2026.03.07")
        );
        assert_eq!(
            extract_date_padded("2026/12/24 live").as_deref(),
            Some("2026.12.24")
        );
    }

    #[test]
    fn test_extract_kanji_date() {
        assert_eq!(
            extract_date_padded("2026年3月7日の舞台").as_deref(),
            Some("2026.03.07")
        );
    }

    #[test]
    fn test_extract_date_without_year_uses_current_year() {
        let got = extract_date_padded("3/7に出演").unwrap();
        let year = today_jst_padded()[..4].to_string();
        assert_eq!(got, format!("{year}.03.07"));
    }

    #[test]
    fn test_extract_no_date() {
        assert_eq!(extract_date_padded("日付なしの本文"), None);
    }

    #[test]
    fn test_view_date_unpads() {
        assert_eq!(view_date_from_padded("2026.03.07"), "2026.3.7");
        assert_eq!(view_date_from_padded("2026.12.24"), "2026.12.24");
    }

    #[test]
    fn test_view_date_passthrough() {
        assert_eq!(view_date_from_padded("not a date"), "not a date");
    }

    #[test]
    fn test_padded_date_or_today() {
        assert_eq!(padded_date_or_today("2026.03.07"), "2026.03.07");
        assert_eq!(padded_date_or_today("garbage"), today_jst_padded());
        assert_eq!(padded_date_or_today("2026.3.7"), today_jst_padded());
    }

    #[test]
    fn test_today_formats() {
        let padded = today_jst_padded();
        assert_eq!(padded.len(), 10);
        assert_eq!(today_jst_yyyymm(), padded[..7].replace('.', ""));
        assert_eq!(today_jst_yyyymmdd(), padded.replace('.', ""));
    }
}

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use regex::Regex;
use std::sync::OnceLock;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%m/%d/%Y",
];

/// Parses the date formats upstreams publish into a calendar date.
///
/// Datetimes with an offset are converted to the date in their own offset, which
/// is the day the release is announced for in its market.
#[must_use]
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.date_naive());
    }

    if let Some(date) = parse_japanese(raw) {
        return Some(date);
    }

    // Datetime strings without offset: keep the date part.
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    for candidate in [raw, date_part] {
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Some(date);
            }
        }
    }

    if raw.len() >= 9 && raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse::<i64>().ok().and_then(from_unix);
    }

    None
}

/// Converts a unix timestamp (seconds) into a date, optionally in a market offset.
#[must_use]
pub fn from_unix(secs: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}

#[must_use]
pub fn from_unix_in(secs: i64, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.with_timezone(&offset).date_naive())
}

fn parse_japanese(raw: &str) -> Option<NaiveDate> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").ok())
        .as_ref()?;

    let caps = re.captures(raw)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    let day = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

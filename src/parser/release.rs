use crate::domain::ReleaseKind;
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Title, installment kind and label recovered from an announcement headline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub title: String,
    pub kind: Option<ReleaseKind>,
    pub label: Option<String>,
}

/// Splits a free-text headline such as `"Demon Tale Vol. 5"` or
/// `"デーモンテイル 第10話"` into the work title and the installment it announces.
#[must_use]
pub fn parse_announcement(headline: &str) -> Option<Announcement> {
    let headline = headline.trim();
    if headline.is_empty() {
        return None;
    }

    parse_volume(headline)
        .or_else(|| parse_japanese_volume(headline))
        .or_else(|| parse_episode(headline))
        .or_else(|| parse_japanese_episode(headline))
        .or_else(|| parse_special(headline))
        .or_else(|| {
            Some(Announcement {
                title: clean_title(headline),
                kind: None,
                label: None,
            })
        })
}

fn get_regex(re: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    re.get_or_init(|| Regex::new(pattern).expect("Invalid regex pattern defined in code"))
}

fn parse_volume(headline: &str) -> Option<Announcement> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = get_regex(
        &RE,
        r"(?i)^(?P<title>.+?)[\s,:\-–]*\b(?:vol(?:ume)?\.?|v\.)\s*(?P<label>\d+(?:\.\d+)?)\b.*$",
    );
    let caps = re.captures(headline)?;
    build(&caps, ReleaseKind::Volume)
}

fn parse_japanese_volume(headline: &str) -> Option<Announcement> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = get_regex(
        &RE,
        r"^(?P<title>.+?)\s*(?:第\s*(?P<label>\d+(?:\.\d+)?)\s*巻|(?P<label2>\d+(?:\.\d+)?)\s*巻).*$",
    );
    let caps = re.captures(headline)?;
    build(&caps, ReleaseKind::Volume)
}

fn parse_episode(headline: &str) -> Option<Announcement> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = get_regex(
        &RE,
        r"(?i)^(?P<title>.+?)[\s,:\-–]*(?:\b(?:episode|ep\.?)\s*|#)(?P<label>\d+(?:\.\d+)?)\b.*$",
    );
    let caps = re.captures(headline)?;
    build(&caps, ReleaseKind::Episode)
}

fn parse_japanese_episode(headline: &str) -> Option<Announcement> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = get_regex(
        &RE,
        r"^(?P<title>.+?)\s*第\s*(?P<label>\d+(?:\.\d+)?)\s*[話回].*$",
    );
    let caps = re.captures(headline)?;
    build(&caps, ReleaseKind::Episode)
}

fn parse_special(headline: &str) -> Option<Announcement> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = get_regex(
        &RE,
        r"(?i)^(?P<title>.+?)[\s,:\-–]+(?P<label>special|ova|oad|recap|extra)\s*$",
    );
    let caps = re.captures(headline)?;
    let title = clean_title(caps.name("title")?.as_str());
    let label = capitalize(caps.name("label")?.as_str());
    (!title.is_empty()).then_some(Announcement {
        title,
        kind: Some(ReleaseKind::Episode),
        label: Some(label),
    })
}

fn build(caps: &Captures<'_>, kind: ReleaseKind) -> Option<Announcement> {
    let title = clean_title(caps.name("title")?.as_str());
    let label = caps
        .name("label")
        .or_else(|| caps.name("label2"))?
        .as_str();

    if title.is_empty() {
        return None;
    }

    Some(Announcement {
        title,
        kind: Some(kind),
        label: Some(canonical_label(label)),
    })
}

/// Strips leading zeros from numeric labels so "05" and "5" name the same installment.
#[must_use]
pub fn canonical_label(label: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        return String::new();
    }

    let (int_part, frac_part) = label.split_once('.').unwrap_or((label, ""));
    if !int_part.is_empty() && int_part.chars().all(|c| c.is_ascii_digit()) {
        let trimmed = int_part.trim_start_matches('0');
        let int_part = if trimmed.is_empty() { "0" } else { trimmed };
        let frac_part = frac_part.trim_end_matches('0');
        if frac_part.is_empty() {
            return int_part.to_string();
        }
        if frac_part.chars().all(|c| c.is_ascii_digit()) {
            return format!("{int_part}.{frac_part}");
        }
    }

    label.to_string()
}

fn clean_title(raw: &str) -> String {
    static BRACKETS: OnceLock<Regex> = OnceLock::new();
    let brackets = get_regex(&BRACKETS, r"^\s*(?:\[[^\]]*\]|【[^】]*】)\s*");
    let stripped = brackets.replace(raw, "");
    stripped
        .trim()
        .trim_end_matches(|c: char| matches!(c, '-' | '–' | ':' | ',' | '|'))
        .trim()
        .to_string()
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    match lower.as_str() {
        "ova" | "oad" => lower.to_uppercase(),
        _ => {
            let mut chars = lower.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().collect::<String>() + chars.as_str()
            })
        }
    }
}

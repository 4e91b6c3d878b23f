use crate::domain::{MediaKind, ReleaseId, ReleaseKind, WorkId};
use chrono::NaiveDate;
use serde::Serialize;

/// The installment part of a normalized item, before it is attached to a Work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFields {
    pub kind: ReleaseKind,
    pub label: String,
    pub channel: String,
    pub date: NaiveDate,
    pub source_id: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Release {
    pub id: ReleaseId,
    pub work_id: WorkId,
    pub work_title: String,
    pub media_kind: MediaKind,
    pub kind: ReleaseKind,
    pub label: String,
    pub channel: String,
    pub date: NaiveDate,
    pub source_id: String,
    pub source_url: Option<String>,
    pub notified: bool,
    pub notified_at: Option<String>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub needs_review: bool,
    pub archived_at: Option<String>,
}

impl Release {
    /// One-line human rendering used by dispatch adapters and the CLI.
    #[must_use]
    pub fn headline(&self) -> String {
        let kind = match self.kind {
            ReleaseKind::Episode => "Episode",
            ReleaseKind::Volume => "Vol.",
        };
        format!(
            "{} {} {} ({}, {})",
            self.work_title, kind, self.label, self.channel, self.date
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(ReleaseId),
    DuplicateIgnored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

/// Channels that must all confirm delivery before a Release counts as notified,
/// and how many failed attempts are tolerated before it goes to review.
#[derive(Debug, Clone)]
pub struct NotifyPolicy {
    pub required_channels: Vec<String>,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Delivery recorded for this channel; `complete` once every required channel has one.
    Delivered { complete: bool },
    /// This channel already had a delivery on record; nothing changed.
    AlreadyRecorded,
    Failed { attempts: i32, needs_review: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headline() {
        let release = Release {
            id: ReleaseId::new(1),
            work_id: WorkId::new(1),
            work_title: "Demon Tale".into(),
            media_kind: MediaKind::SerialVideo,
            kind: ReleaseKind::Episode,
            label: "10".into(),
            channel: "crunchyroll".into(),
            date: NaiveDate::from_ymd_opt(2025, 12, 10).unwrap(),
            source_id: "anilist".into(),
            source_url: None,
            notified: false,
            notified_at: None,
            attempt_count: 0,
            last_error: None,
            needs_review: false,
            archived_at: None,
        };
        assert_eq!(
            release.headline(),
            "Demon Tale Episode 10 (crunchyroll, 2025-12-10)"
        );
    }
}

use crate::domain::{MediaKind, WorkId, WorkStatus};
use serde::Serialize;

/// A canonical Work as stored in the catalog.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Work {
    pub id: WorkId,
    pub canonical_title: String,
    pub alternate_titles: Vec<String>,
    pub media_kind: MediaKind,
    pub status: WorkStatus,
    pub external_urls: Vec<String>,
    pub provenance_count: i32,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Work {
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Canonical title first, then alternates in first-seen order.
    pub fn titles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_title.as_str())
            .chain(self.alternate_titles.iter().map(String::as_str))
    }
}

/// Everything needed to create a Work from the first item that names it.
#[derive(Debug, Clone)]
pub struct WorkCandidate {
    pub canonical_title: String,
    pub alternate_titles: Vec<String>,
    pub media_kind: MediaKind,
    pub status: WorkStatus,
    pub external_url: Option<String>,
    pub source_id: String,
}

/// Result of [`crate::db::Store::upsert_work_with_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUpsert {
    pub id: WorkId,
    /// False when a Work with the same folded title and media kind was already stored.
    pub created: bool,
}

/// A later sighting of an existing Work by some source.
#[derive(Debug, Clone)]
pub struct Corroboration {
    pub titles: Vec<String>,
    pub source_id: String,
    pub status: Option<WorkStatus>,
    pub external_url: Option<String>,
}

use super::release::ReleaseFields;
use crate::domain::{MediaKind, WorkStatus};

/// Canonical shape every upstream record is converted into by the normalizer.
///
/// Nothing downstream of the normalizer looks at which adapter produced a record;
/// `source_id` is kept only for provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub source_id: String,
    pub title: String,
    pub alternate_titles: Vec<String>,
    pub media_kind: MediaKind,
    pub status: Option<WorkStatus>,
    pub categories: Vec<String>,
    pub external_url: Option<String>,
    /// Absent when the record named a Work but no dated installment.
    pub release: Option<ReleaseFields>,
}

impl NormalizedItem {
    /// Primary title followed by alternates.
    pub fn titles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.title.as_str()).chain(self.alternate_titles.iter().map(String::as_str))
    }
}

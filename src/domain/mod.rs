//! Domain types for the release catalog with strong typing.
//!
//! Newtype identifiers keep Work and Release ids from being mixed, and the
//! enums below are the canonical vocabulary every component past the
//! normalizer speaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a canonical Work.
///
/// # Examples
///
/// ```rust
/// use shinkan::domain::WorkId;
///
/// let id = WorkId::new(42);
/// assert_eq!(id.value(), 42);
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(i32);

impl WorkId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        debug_assert!(id >= 0, "WorkId should be non-negative");
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for WorkId {
    fn from(id: i32) -> Self {
        Self::new(id)
    }
}

impl From<WorkId> for i32 {
    fn from(id: WorkId) -> Self {
        id.0
    }
}

/// Unique identifier for a Release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(i32);

impl ReleaseId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        debug_assert!(id >= 0, "ReleaseId should be non-negative");
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ReleaseId {
    fn from(id: i32) -> Self {
        Self::new(id)
    }
}

impl From<ReleaseId> for i32 {
    fn from(id: ReleaseId) -> Self {
        id.0
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Returned when a persisted or configured string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    SerialVideo,
    SerialPrint,
}

string_enum!(MediaKind {
    SerialVideo => "serial-video",
    SerialPrint => "serial-print",
});

impl MediaKind {
    /// The installment kind a release of this media normally has.
    #[must_use]
    pub const fn default_release_kind(self) -> ReleaseKind {
        match self {
            Self::SerialVideo => ReleaseKind::Episode,
            Self::SerialPrint => ReleaseKind::Volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Upcoming,
    #[default]
    Ongoing,
    Completed,
    Cancelled,
}

string_enum!(WorkStatus {
    Upcoming => "upcoming",
    Ongoing => "ongoing",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl WorkStatus {
    /// Maps the status vocabularies upstreams use (`RELEASING`, `Currently Airing`,
    /// `Finished`, ...) onto the lifecycle enum.
    #[must_use]
    pub fn from_upstream(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase().replace(['_', '-'], " ");
        match lowered.as_str() {
            "not yet released" | "not yet aired" | "upcoming" | "announced" | "tba" => {
                Some(Self::Upcoming)
            }
            "releasing" | "currently airing" | "ongoing" | "publishing" | "airing" => {
                Some(Self::Ongoing)
            }
            "finished" | "finished airing" | "completed" | "complete" | "finished publishing" => {
                Some(Self::Completed)
            }
            "cancelled" | "canceled" | "discontinued" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Episode,
    Volume,
}

string_enum!(ReleaseKind {
    Episode => "episode",
    Volume => "volume",
});

/// Tier at which the deduplication engine resolved an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Exact,
    Normalized,
    Fuzzy,
    Phonetic,
}

string_enum!(MatchTier {
    Exact => "exact",
    Normalized => "normalized",
    Fuzzy => "fuzzy",
    Phonetic => "phonetic",
});

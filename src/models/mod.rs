pub mod item;
pub mod release;
pub mod work;

pub use item::NormalizedItem;
pub use release::{
    DeliveryOutcome, MarkOutcome, NotifyPolicy, Release, ReleaseFields, UpsertOutcome,
};
pub use work::{Corroboration, Work, WorkCandidate, WorkUpsert};

pub mod collector;
pub use collector::{CollectionOrchestrator, CollectionResult, SourceOutcome, SourceReport};

pub mod normalizer;
pub use normalizer::{DiscardReason, Normalizer};

pub mod filter;
pub use filter::{ContentFilter, Exclusion, ExclusionTier};

pub mod dedup;
pub use dedup::{CatalogIndex, DeduplicationEngine, MatchDecision};

pub mod dispatch;
pub use dispatch::{
    DeliveryReport, DispatchError, LogDispatcher, NotificationDispatcher, WebhookDispatcher,
    build_dispatchers,
};

pub mod notify;
pub use notify::{BatchPlan, BatchPlanner, NotificationScheduler, NotifyReport, PlanMode};

pub mod pipeline;
pub use pipeline::{IngestPipeline, RunReport};

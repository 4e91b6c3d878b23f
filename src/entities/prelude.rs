pub use super::release_notifications::Entity as ReleaseNotifications;
pub use super::releases::Entity as Releases;
pub use super::source_markers::Entity as SourceMarkers;
pub use super::work_sources::Entity as WorkSources;
pub use super::works::Entity as Works;

pub mod prelude;

pub mod release_notifications;
pub mod releases;
pub mod source_markers;
pub mod work_sources;
pub mod works;

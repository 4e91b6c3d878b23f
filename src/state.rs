use std::sync::Arc;
use std::time::Duration;

use crate::clients::{ResilientSource, build_client};
use crate::config::Config;
use crate::db::Store;
use crate::services::{
    CollectionOrchestrator, IngestPipeline, NotificationDispatcher, NotificationScheduler,
    build_dispatchers,
};

/// Everything one process needs, wired once from the configuration.
pub struct SharedState {
    pub config: Config,

    pub store: Store,

    pub pipeline: IngestPipeline,

    pub scheduler: NotificationScheduler,
}

impl SharedState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store = Store::with_pool_options(
            &config.general.database_path,
            config.general.max_db_connections,
            config.general.min_db_connections,
            Duration::from_millis(config.general.busy_timeout_ms),
        )
        .await?;

        let dispatchers = build_dispatchers(&config)?;
        let sources = build_sources(&config)?;
        Self::with_parts(config, store, sources, dispatchers)
    }

    /// Wires the services around an open store and prebuilt adapters.
    pub fn with_parts(
        config: Config,
        store: Store,
        sources: Vec<Arc<ResilientSource>>,
        dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
    ) -> anyhow::Result<Self> {
        let collector =
            CollectionOrchestrator::new(sources, config.collection.max_concurrent_sources);
        let pipeline = IngestPipeline::new(store.clone(), collector, &config);
        let scheduler =
            NotificationScheduler::new(store.clone(), &config.notifications, dispatchers)?;

        Ok(Self {
            config,
            store,
            pipeline,
            scheduler,
        })
    }
}

fn build_sources(config: &Config) -> anyhow::Result<Vec<Arc<ResilientSource>>> {
    config
        .sources
        .iter()
        .filter(|s| s.enabled)
        .map(|source| {
            let client = build_client(source, &config.collection.user_agent)?;
            Ok(Arc::new(ResilientSource::new(source, client)))
        })
        .collect()
}

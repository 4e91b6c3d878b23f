use crate::domain::{ReleaseId, UnknownVariant, WorkId};
use crate::models::{
    Corroboration, DeliveryOutcome, MarkOutcome, NotifyPolicy, Release, ReleaseFields,
    UpsertOutcome, Work, WorkCandidate, WorkUpsert,
};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod migrator;
pub mod repositories;

/// Errors surfaced by catalog operations.
///
/// A duplicate Release is not an error; it comes back as
/// [`UpsertOutcome::DuplicateIgnored`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("corrupt {field}: {detail}")]
    Corrupt { field: &'static str, detail: String },
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        Self::Corrupt {
            field: err.kind,
            detail: err.value,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt {
            field: "json column",
            detail: err.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Works as the dedup engine sees them at the start of a run, deleted ones included.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub works: Vec<Work>,
}

#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1, Duration::from_secs(5)).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        let in_memory = db_url.contains(":memory:");
        if !in_memory {
            let path_str = db_url.trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(600))
            .sqlx_logging(false)
            .map_sqlx_sqlite_opts(move |opts: SqliteConnectOptions| {
                let opts = opts.busy_timeout(busy_timeout).foreign_keys(true);
                if in_memory {
                    opts
                } else {
                    opts.journal_mode(SqliteJournalMode::Wal)
                }
            });

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            event = "store_opened",
            pool_min = min_connections,
            pool_max = max_connections,
            busy_timeout_ms = u64::try_from(busy_timeout.as_millis()).unwrap_or(u64::MAX),
            "Database connected & migrations applied"
        );

        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        self.conn
            .query_one(Statement::from_string(backend, "SELECT 1".to_string()))
            .await?;
        Ok(())
    }

    fn work_repo(&self) -> repositories::work::WorkRepository {
        repositories::work::WorkRepository::new(self.conn.clone())
    }

    fn release_repo(&self) -> repositories::release::ReleaseRepository {
        repositories::release::ReleaseRepository::new(self.conn.clone())
    }

    fn source_repo(&self) -> repositories::source::SourceRepository {
        repositories::source::SourceRepository::new(self.conn.clone())
    }

    // Works

    pub async fn upsert_work(&self, candidate: &WorkCandidate) -> StoreResult<WorkId> {
        Ok(self.work_repo().upsert(candidate).await?.id)
    }

    /// Like [`Store::upsert_work`], also telling whether the row is new.
    pub async fn upsert_work_with_outcome(
        &self,
        candidate: &WorkCandidate,
    ) -> StoreResult<WorkUpsert> {
        self.work_repo().upsert(candidate).await
    }

    pub async fn corroborate_work(
        &self,
        id: WorkId,
        sighting: &Corroboration,
    ) -> StoreResult<Work> {
        self.work_repo().corroborate(id, sighting).await
    }

    pub async fn get_work(&self, id: WorkId) -> StoreResult<Option<Work>> {
        self.work_repo().get(id).await
    }

    pub async fn list_works(&self) -> StoreResult<Vec<Work>> {
        self.work_repo().list(false).await
    }

    pub async fn soft_delete_work(&self, id: WorkId) -> StoreResult<bool> {
        self.work_repo().soft_delete(id).await
    }

    pub async fn catalog_snapshot(&self) -> StoreResult<CatalogSnapshot> {
        Ok(CatalogSnapshot {
            works: self.work_repo().list(true).await?,
        })
    }

    // Releases

    pub async fn upsert_release(
        &self,
        work_id: WorkId,
        fields: &ReleaseFields,
    ) -> StoreResult<UpsertOutcome> {
        self.release_repo().upsert(work_id, fields).await
    }

    pub async fn get_release(&self, id: ReleaseId) -> StoreResult<Option<Release>> {
        self.release_repo().get(id).await
    }

    pub async fn list_pending_releases(&self, as_of: NaiveDate) -> StoreResult<Vec<Release>> {
        self.release_repo().list_pending(as_of).await
    }

    pub async fn releases_for_work(&self, work_id: WorkId) -> StoreResult<Vec<Release>> {
        self.release_repo().for_work(work_id).await
    }

    pub async fn review_queue(&self) -> StoreResult<Vec<Release>> {
        self.release_repo().review_queue().await
    }

    pub async fn requeue_release(&self, id: ReleaseId) -> StoreResult<bool> {
        self.release_repo().requeue(id).await
    }

    pub async fn delivered_channels(
        &self,
        ids: &[ReleaseId],
    ) -> StoreResult<HashMap<ReleaseId, HashSet<String>>> {
        self.release_repo().delivered_channels(ids).await
    }

    pub async fn mark_notified(
        &self,
        id: ReleaseId,
        channel: &str,
        outcome: &DeliveryOutcome,
        policy: &NotifyPolicy,
    ) -> StoreResult<MarkOutcome> {
        self.mark_notified_at(id, channel, outcome, policy, Utc::now())
            .await
    }

    /// Like [`Store::mark_notified`], stamping the delivery with `at`.
    pub async fn mark_notified_at(
        &self,
        id: ReleaseId,
        channel: &str,
        outcome: &DeliveryOutcome,
        policy: &NotifyPolicy,
        at: DateTime<Utc>,
    ) -> StoreResult<MarkOutcome> {
        self.release_repo()
            .mark_notified(id, channel, outcome, policy, at)
            .await
    }

    pub async fn count_notified_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.release_repo().count_notified_between(from, to).await
    }

    pub async fn archive_notified(&self, before: NaiveDate) -> StoreResult<u64> {
        self.release_repo().archive_notified(before).await
    }

    // Sources

    pub async fn source_markers(&self) -> StoreResult<HashMap<String, String>> {
        self.source_repo().markers().await
    }

    pub async fn source_marker(&self, source_id: &str) -> StoreResult<Option<String>> {
        self.source_repo().get_marker(source_id).await
    }

    pub async fn set_source_marker(&self, source_id: &str, marker: &str) -> StoreResult<()> {
        self.source_repo().set_marker(source_id, marker).await
    }
}

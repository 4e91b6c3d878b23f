use crate::db::{StoreError, StoreResult};
use crate::domain::WorkId;
use crate::entities::{prelude::*, work_sources, works};
use crate::models::{Corroboration, Work, WorkCandidate, WorkUpsert};
use crate::parser::title;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};

/// Repository for canonical Works and the sources that corroborate them.
pub struct WorkRepository {
    conn: DatabaseConnection,
}

impl WorkRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(m: works::Model) -> StoreResult<Work> {
        Ok(Work {
            id: WorkId::new(m.id),
            canonical_title: m.canonical_title,
            alternate_titles: serde_json::from_str(&m.alternate_titles)?,
            media_kind: m.media_kind.parse()?,
            status: m.status.parse()?,
            external_urls: serde_json::from_str(&m.external_urls)?,
            provenance_count: m.provenance_count,
            created_at: m.created_at,
            updated_at: m.updated_at,
            deleted_at: m.deleted_at,
        })
    }

    /// Inserts the Work unless one with the same folded title and media kind
    /// exists, and returns the id of whichever row is now in the catalog.
    pub async fn upsert(&self, candidate: &WorkCandidate) -> StoreResult<WorkUpsert> {
        let now = chrono::Utc::now().to_rfc3339();
        let title_key = title::fold(&candidate.canonical_title);

        let mut alternates: Vec<String> = Vec::new();
        for alt in &candidate.alternate_titles {
            push_title(&mut alternates, &candidate.canonical_title, alt);
        }
        let urls: Vec<String> = candidate.external_url.iter().cloned().collect();

        let txn = self.conn.begin().await?;

        let active_model = works::ActiveModel {
            canonical_title: Set(candidate.canonical_title.clone()),
            title_key: Set(title_key.clone()),
            media_kind: Set(candidate.media_kind.to_string()),
            status: Set(candidate.status.to_string()),
            alternate_titles: Set(serde_json::to_string(&alternates)?),
            external_urls: Set(serde_json::to_string(&urls)?),
            provenance_count: Set(0),
            created_at: Set(now.clone()),
            updated_at: Set(now.clone()),
            deleted_at: Set(None),
            ..Default::default()
        };

        let inserted = Works::insert(active_model)
            .on_conflict(
                OnConflict::columns([works::Column::MediaKind, works::Column::TitleKey])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;

        let model = Works::find()
            .filter(works::Column::MediaKind.eq(candidate.media_kind.to_string()))
            .filter(works::Column::TitleKey.eq(title_key.clone()))
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "work",
                key: title_key,
            })?;

        Self::record_source(&txn, model.id, &candidate.source_id, &now).await?;

        txn.commit().await?;
        Ok(WorkUpsert {
            id: WorkId::new(model.id),
            created: inserted > 0,
        })
    }

    /// Folds a later sighting into an existing Work: new titles become
    /// alternates, the source is counted once, status and URLs are refreshed.
    pub async fn corroborate(&self, id: WorkId, sighting: &Corroboration) -> StoreResult<Work> {
        let now = chrono::Utc::now().to_rfc3339();
        let txn = self.conn.begin().await?;

        // Takes the write lock before reading.
        let touched = Works::update_many()
            .col_expr(works::Column::UpdatedAt, Expr::col(works::Column::UpdatedAt).into())
            .filter(works::Column::Id.eq(id.value()))
            .exec(&txn)
            .await?;
        if touched.rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "work",
                key: id.to_string(),
            });
        }

        let model = Works::find_by_id(id.value())
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "work",
                key: id.to_string(),
            })?;

        let mut alternates: Vec<String> = serde_json::from_str(&model.alternate_titles)?;
        let mut urls: Vec<String> = serde_json::from_str(&model.external_urls)?;
        let before = (alternates.len(), urls.len());

        for title in &sighting.titles {
            push_title(&mut alternates, &model.canonical_title, title);
        }
        if let Some(url) = &sighting.external_url
            && !urls.contains(url)
        {
            urls.push(url.clone());
        }

        let status_changed = sighting
            .status
            .is_some_and(|s| s.as_str() != model.status.as_str());

        if before != (alternates.len(), urls.len()) || status_changed {
            let mut active: works::ActiveModel = model.into();
            active.alternate_titles = Set(serde_json::to_string(&alternates)?);
            active.external_urls = Set(serde_json::to_string(&urls)?);
            if let Some(status) = sighting.status {
                active.status = Set(status.to_string());
            }
            active.updated_at = Set(now.clone());
            active.update(&txn).await?;
        }

        Self::record_source(&txn, id.value(), &sighting.source_id, &now).await?;

        let refreshed = Works::find_by_id(id.value())
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "work",
                key: id.to_string(),
            })?;

        txn.commit().await?;
        Self::map_model(refreshed)
    }

    async fn record_source<C: ConnectionTrait>(
        conn: &C,
        work_id: i32,
        source_id: &str,
        now: &str,
    ) -> StoreResult<()> {
        let link = work_sources::ActiveModel {
            work_id: Set(work_id),
            source_id: Set(source_id.to_string()),
            first_seen_at: Set(now.to_string()),
        };

        let inserted = WorkSources::insert(link)
            .on_conflict(
                OnConflict::columns([work_sources::Column::WorkId, work_sources::Column::SourceId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;

        if inserted > 0 {
            let count = WorkSources::find()
                .filter(work_sources::Column::WorkId.eq(work_id))
                .count(conn)
                .await?;

            Works::update_many()
                .col_expr(
                    works::Column::ProvenanceCount,
                    Expr::value(i32::try_from(count).unwrap_or(i32::MAX)),
                )
                .filter(works::Column::Id.eq(work_id))
                .exec(conn)
                .await?;
        }

        Ok(())
    }

    pub async fn get(&self, id: WorkId) -> StoreResult<Option<Work>> {
        Works::find_by_id(id.value())
            .one(&self.conn)
            .await?
            .map(Self::map_model)
            .transpose()
    }

    /// All Works ordered by id; soft-deleted rows only when asked for.
    pub async fn list(&self, include_deleted: bool) -> StoreResult<Vec<Work>> {
        let mut query = Works::find().order_by_asc(works::Column::Id);
        if !include_deleted {
            query = query.filter(works::Column::DeletedAt.is_null());
        }

        query
            .all(&self.conn)
            .await?
            .into_iter()
            .map(Self::map_model)
            .collect()
    }

    pub async fn soft_delete(&self, id: WorkId) -> StoreResult<bool> {
        let txn = self.conn.begin().await?;
        let result = Works::update_many()
            .col_expr(
                works::Column::DeletedAt,
                Expr::value(chrono::Utc::now().to_rfc3339()),
            )
            .filter(works::Column::Id.eq(id.value()))
            .filter(works::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;
        txn.commit().await?;

        Ok(result.rows_affected > 0)
    }
}

/// Appends `title` unless it folds to the canonical title or an existing alternate.
fn push_title(alternates: &mut Vec<String>, canonical: &str, title: &str) {
    let title = title::clean_whitespace(title);
    if title.is_empty() {
        return;
    }
    let key = title::fold(&title);
    if key == title::fold(canonical) || alternates.iter().any(|a| title::fold(a) == key) {
        return;
    }
    alternates.push(title);
}

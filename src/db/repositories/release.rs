use crate::db::{StoreError, StoreResult};
use crate::domain::{ReleaseId, WorkId};
use crate::entities::{prelude::*, release_notifications, releases, works};
use crate::models::{DeliveryOutcome, MarkOutcome, NotifyPolicy, Release, ReleaseFields, UpsertOutcome};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Select,
    Set, TransactionTrait,
};
use std::collections::{HashMap, HashSet};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fixed-width UTC timestamps, so string order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Repository for Releases and their per-channel notification ledger.
pub struct ReleaseRepository {
    conn: DatabaseConnection,
}

impl ReleaseRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(r: releases::Model, work: Option<works::Model>) -> StoreResult<Release> {
        let work = work.ok_or_else(|| StoreError::Corrupt {
            field: "releases.work_id",
            detail: format!("release {} points at missing work {}", r.id, r.work_id),
        })?;

        let date = NaiveDate::parse_from_str(&r.release_date, DATE_FORMAT).map_err(|e| {
            StoreError::Corrupt {
                field: "releases.release_date",
                detail: format!("{}: {e}", r.release_date),
            }
        })?;

        Ok(Release {
            id: ReleaseId::new(r.id),
            work_id: WorkId::new(r.work_id),
            work_title: work.canonical_title,
            media_kind: work.media_kind.parse()?,
            kind: r.release_kind.parse()?,
            label: r.label,
            channel: r.channel,
            date,
            source_id: r.source_id,
            source_url: r.source_url,
            notified: r.notified,
            notified_at: r.notified_at,
            attempt_count: r.attempt_count,
            last_error: r.last_error,
            needs_review: r.needs_review,
            archived_at: r.archived_at,
        })
    }

    async fn fetch(&self, query: Select<Releases>) -> StoreResult<Vec<Release>> {
        query
            .find_also_related(Works)
            .all(&self.conn)
            .await?
            .into_iter()
            .map(|(r, w)| Self::map_model(r, w))
            .collect()
    }

    /// Inserts the Release unless its `(work, kind, label, channel, date)`
    /// tuple is already present. The conflict check happens inside the insert,
    /// so concurrent writers cannot both create the same Release.
    pub async fn upsert(&self, work_id: WorkId, fields: &ReleaseFields) -> StoreResult<UpsertOutcome> {
        let date = fields.date.format(DATE_FORMAT).to_string();
        let txn = self.conn.begin().await?;

        let active_model = releases::ActiveModel {
            work_id: Set(work_id.value()),
            release_kind: Set(fields.kind.to_string()),
            label: Set(fields.label.clone()),
            channel: Set(fields.channel.clone()),
            release_date: Set(date.clone()),
            source_id: Set(fields.source_id.clone()),
            source_url: Set(fields.source_url.clone()),
            notified: Set(false),
            notified_at: Set(None),
            attempt_count: Set(0),
            last_error: Set(None),
            needs_review: Set(false),
            created_at: Set(chrono::Utc::now().to_rfc3339()),
            archived_at: Set(None),
            ..Default::default()
        };

        let inserted = Releases::insert(active_model)
            .on_conflict(
                OnConflict::columns([
                    releases::Column::WorkId,
                    releases::Column::ReleaseKind,
                    releases::Column::Label,
                    releases::Column::Channel,
                    releases::Column::ReleaseDate,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;

        if inserted == 0 {
            txn.commit().await?;
            return Ok(UpsertOutcome::DuplicateIgnored);
        }

        let model = Releases::find()
            .filter(releases::Column::WorkId.eq(work_id.value()))
            .filter(releases::Column::ReleaseKind.eq(fields.kind.to_string()))
            .filter(releases::Column::Label.eq(fields.label.clone()))
            .filter(releases::Column::Channel.eq(fields.channel.clone()))
            .filter(releases::Column::ReleaseDate.eq(date))
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "release",
                key: format!("{work_id}/{}/{}", fields.kind, fields.label),
            })?;

        txn.commit().await?;
        Ok(UpsertOutcome::Created(ReleaseId::new(model.id)))
    }

    /// Releases due on or before `as_of` that still await notification,
    /// ordered by date then id.
    pub async fn list_pending(&self, as_of: NaiveDate) -> StoreResult<Vec<Release>> {
        let query = Releases::find()
            .filter(releases::Column::Notified.eq(false))
            .filter(releases::Column::NeedsReview.eq(false))
            .filter(releases::Column::ArchivedAt.is_null())
            .filter(releases::Column::ReleaseDate.lte(as_of.format(DATE_FORMAT).to_string()))
            .filter(works::Column::DeletedAt.is_null())
            .order_by_asc(releases::Column::ReleaseDate)
            .order_by_asc(releases::Column::Id);

        self.fetch(query).await
    }

    pub async fn get(&self, id: ReleaseId) -> StoreResult<Option<Release>> {
        let mut rows = self
            .fetch(Releases::find().filter(releases::Column::Id.eq(id.value())))
            .await?;
        Ok(rows.pop())
    }

    pub async fn for_work(&self, work_id: WorkId) -> StoreResult<Vec<Release>> {
        let query = Releases::find()
            .filter(releases::Column::WorkId.eq(work_id.value()))
            .order_by_asc(releases::Column::ReleaseDate)
            .order_by_asc(releases::Column::Id);

        self.fetch(query).await
    }

    pub async fn review_queue(&self) -> StoreResult<Vec<Release>> {
        let query = Releases::find()
            .filter(releases::Column::NeedsReview.eq(true))
            .filter(releases::Column::ArchivedAt.is_null())
            .order_by_asc(releases::Column::ReleaseDate)
            .order_by_asc(releases::Column::Id);

        self.fetch(query).await
    }

    /// Releases whose notification completed within `[from, to)`.
    pub async fn count_notified_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let count = Releases::find()
            .filter(releases::Column::Notified.eq(true))
            .filter(releases::Column::NotifiedAt.gte(timestamp(from)))
            .filter(releases::Column::NotifiedAt.lt(timestamp(to)))
            .count(&self.conn)
            .await?;
        Ok(count)
    }

    /// Channels that already confirmed delivery, per release.
    pub async fn delivered_channels(
        &self,
        ids: &[ReleaseId],
    ) -> StoreResult<HashMap<ReleaseId, HashSet<String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = ReleaseNotifications::find()
            .filter(
                release_notifications::Column::ReleaseId
                    .is_in(ids.iter().map(|id| id.value()).collect::<Vec<_>>()),
            )
            .all(&self.conn)
            .await?;

        let mut map: HashMap<ReleaseId, HashSet<String>> = HashMap::new();
        for row in rows {
            map.entry(ReleaseId::new(row.release_id))
                .or_default()
                .insert(row.channel);
        }
        Ok(map)
    }

    /// Records one channel's delivery outcome for a release.
    ///
    /// A delivery is written to the ledger with insert-or-ignore, so a channel
    /// is recorded at most once; the release leaves the pending set once every
    /// required channel has a row. A failure bumps the attempt count and flags
    /// the release for review when the policy's limit is reached.
    ///
    /// Both branches write before they read so concurrent callers queue on the
    /// SQLite write lock instead of failing on a stale read snapshot.
    pub async fn mark_notified(
        &self,
        id: ReleaseId,
        channel: &str,
        outcome: &DeliveryOutcome,
        policy: &NotifyPolicy,
        at: DateTime<Utc>,
    ) -> StoreResult<MarkOutcome> {
        let now = timestamp(at);
        let txn = self.conn.begin().await?;

        let result = match outcome {
            DeliveryOutcome::Delivered => {
                let entry = release_notifications::ActiveModel {
                    release_id: Set(id.value()),
                    channel: Set(channel.to_string()),
                    notified_at: Set(now.clone()),
                };

                let inserted = ReleaseNotifications::insert(entry)
                    .on_conflict(
                        OnConflict::columns([
                            release_notifications::Column::ReleaseId,
                            release_notifications::Column::Channel,
                        ])
                        .do_nothing()
                        .to_owned(),
                    )
                    .exec_without_returning(&txn)
                    .await?;

                if inserted == 0 {
                    MarkOutcome::AlreadyRecorded
                } else {
                    let delivered: HashSet<String> = ReleaseNotifications::find()
                        .filter(release_notifications::Column::ReleaseId.eq(id.value()))
                        .all(&txn)
                        .await?
                        .into_iter()
                        .map(|row| row.channel)
                        .collect();

                    let complete = policy
                        .required_channels
                        .iter()
                        .all(|c| delivered.contains(c));

                    if complete {
                        Releases::update_many()
                            .col_expr(releases::Column::Notified, Expr::value(true))
                            .col_expr(releases::Column::NotifiedAt, Expr::value(now))
                            .filter(releases::Column::Id.eq(id.value()))
                            .filter(releases::Column::Notified.eq(false))
                            .exec(&txn)
                            .await?;
                    }

                    MarkOutcome::Delivered { complete }
                }
            }
            DeliveryOutcome::Failed(detail) => {
                let updated = Releases::update_many()
                    .col_expr(
                        releases::Column::AttemptCount,
                        Expr::col(releases::Column::AttemptCount).add(1),
                    )
                    .col_expr(
                        releases::Column::LastError,
                        Expr::value(format!("{channel}: {detail}")),
                    )
                    .filter(releases::Column::Id.eq(id.value()))
                    .filter(releases::Column::Notified.eq(false))
                    .exec(&txn)
                    .await?;

                if updated.rows_affected == 0 {
                    MarkOutcome::AlreadyRecorded
                } else {
                    let release = Releases::find_by_id(id.value()).one(&txn).await?.ok_or(
                        StoreError::NotFound {
                            entity: "release",
                            key: id.to_string(),
                        },
                    )?;
                    let attempts = release.attempt_count;
                    let limit = i32::try_from(policy.max_attempts).unwrap_or(i32::MAX);
                    let needs_review = attempts >= limit;

                    if needs_review {
                        Releases::update_many()
                            .col_expr(releases::Column::NeedsReview, Expr::value(true))
                            .filter(releases::Column::Id.eq(id.value()))
                            .exec(&txn)
                            .await?;
                    }

                    MarkOutcome::Failed {
                        attempts,
                        needs_review,
                    }
                }
            }
        };

        let known = Releases::find_by_id(id.value()).one(&txn).await?.is_some();
        if !known {
            return Err(StoreError::NotFound {
                entity: "release",
                key: id.to_string(),
            });
        }

        txn.commit().await?;
        Ok(result)
    }

    /// Clears the review flag and attempt count so the release is retried.
    pub async fn requeue(&self, id: ReleaseId) -> StoreResult<bool> {
        let txn = self.conn.begin().await?;
        let result = Releases::update_many()
            .col_expr(releases::Column::NeedsReview, Expr::value(false))
            .col_expr(releases::Column::AttemptCount, Expr::value(0))
            .filter(releases::Column::Id.eq(id.value()))
            .filter(releases::Column::NeedsReview.eq(true))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        Ok(result.rows_affected > 0)
    }

    /// Archives notified releases dated before `before`. Rows are kept so the
    /// unique tuple keeps blocking re-creation.
    pub async fn archive_notified(&self, before: NaiveDate) -> StoreResult<u64> {
        let txn = self.conn.begin().await?;
        let result = Releases::update_many()
            .col_expr(
                releases::Column::ArchivedAt,
                Expr::value(chrono::Utc::now().to_rfc3339()),
            )
            .filter(releases::Column::Notified.eq(true))
            .filter(releases::Column::ArchivedAt.is_null())
            .filter(releases::Column::ReleaseDate.lt(before.format(DATE_FORMAT).to_string()))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        Ok(result.rows_affected)
    }
}

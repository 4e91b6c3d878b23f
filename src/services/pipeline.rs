use crate::clients::{SinceMarker, SourcedRecord};
use crate::config::Config;
use crate::db::{Store, StoreError};
use crate::domain::{MatchTier, WorkId};
use crate::models::{Corroboration, NormalizedItem, UpsertOutcome, Work, WorkCandidate};
use crate::services::collector::{CollectionOrchestrator, SourceReport};
use crate::services::dedup::{CatalogIndex, DeduplicationEngine, MatchDecision};
use crate::services::filter::ContentFilter;
use crate::services::normalizer::Normalizer;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct RunReport {
    pub run_id: String,
    pub sources: Vec<SourceReport>,
    pub records: usize,
    pub discarded: usize,
    pub excluded: usize,
    pub works_created: usize,
    pub works_matched: BTreeMap<MatchTier, usize>,
    pub skipped_deleted: usize,
    pub releases_created: usize,
    pub releases_duplicate: usize,
    pub cancelled: bool,
}

impl RunReport {
    #[must_use]
    pub fn matched_total(&self) -> usize {
        self.works_matched.values().sum()
    }
}

enum ItemOutcome {
    Created(WorkId),
    Matched(WorkId, MatchTier),
    SkippedDeleted,
}

/// One collection run: collect from every source, then push each record
/// through normalize, filter, resolve and persist strictly in order against a
/// single run-scoped catalog index.
pub struct IngestPipeline {
    store: Store,
    collector: CollectionOrchestrator,
    normalizer: Normalizer,
    filter: ContentFilter,
    dedup: DeduplicationEngine,
}

impl IngestPipeline {
    #[must_use]
    pub fn new(store: Store, collector: CollectionOrchestrator, config: &Config) -> Self {
        Self {
            store,
            collector,
            normalizer: Normalizer::new(config),
            filter: ContentFilter::new(&config.filter),
            dedup: DeduplicationEngine::new(&config.dedup),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunReport> {
        let start = Instant::now();
        let started_at = Utc::now();
        let mut report = RunReport {
            run_id: Uuid::new_v4().to_string(),
            ..RunReport::default()
        };

        info!(
            event = "ingest_started",
            run_id = %report.run_id,
            sources = self.collector.source_count(),
            "Starting ingest run"
        );

        let markers = self.store.source_markers().await?;
        let collected = self.collector.run(&markers, cancel).await;
        report.records = collected.records.len();

        let mut index = CatalogIndex::from_snapshot(&self.store.catalog_snapshot().await?);
        debug!(works = index.len(), "Catalog index built");

        for record in &collected.records {
            if cancel.is_cancelled() {
                break;
            }
            self.ingest(record, &mut index, &mut report).await?;
        }

        report.cancelled = cancel.is_cancelled();
        if report.cancelled {
            warn!(
                event = "ingest_cancelled",
                run_id = %report.run_id,
                "Run cancelled, source markers left unchanged"
            );
        } else {
            let marker = SinceMarker::at(started_at);
            for source_id in collected.succeeded_sources() {
                self.store
                    .set_source_marker(source_id, marker.as_str())
                    .await?;
            }
        }
        report.sources = collected.reports;

        info!(
            event = "ingest_finished",
            run_id = %report.run_id,
            records = report.records,
            discarded = report.discarded,
            excluded = report.excluded,
            works_created = report.works_created,
            works_matched = report.matched_total(),
            releases_created = report.releases_created,
            releases_duplicate = report.releases_duplicate,
            cancelled = report.cancelled,
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Ingest run finished"
        );

        Ok(report)
    }

    async fn ingest(
        &self,
        record: &SourcedRecord,
        index: &mut CatalogIndex,
        report: &mut RunReport,
    ) -> Result<(), StoreError> {
        let Some(item) = self.normalizer.normalize(record) else {
            report.discarded += 1;
            return Ok(());
        };

        if let Some(exclusion) = self.filter.should_exclude(&item) {
            debug!(
                event = "item_excluded",
                source = %item.source_id,
                title = %item.title,
                tier = %exclusion.tier,
                rule = %exclusion.rule,
                "Item excluded by content filter"
            );
            metrics::counter!("shinkan_items_excluded_total", "tier" => exclusion.tier.to_string())
                .increment(1);
            report.excluded += 1;
            return Ok(());
        }

        let work_id = match self.persist_work(&item, index).await? {
            ItemOutcome::Created(id) => {
                report.works_created += 1;
                metrics::counter!("shinkan_works_created_total").increment(1);
                id
            }
            ItemOutcome::Matched(id, tier) => {
                *report.works_matched.entry(tier).or_default() += 1;
                metrics::counter!("shinkan_works_matched_total", "tier" => tier.as_str())
                    .increment(1);
                id
            }
            ItemOutcome::SkippedDeleted => {
                report.skipped_deleted += 1;
                return Ok(());
            }
        };

        if let Some(fields) = &item.release {
            match self.store.upsert_release(work_id, fields).await? {
                UpsertOutcome::Created(release_id) => {
                    debug!(
                        event = "release_created",
                        release_id = %release_id,
                        work_id = %work_id,
                        label = %fields.label,
                        date = %fields.date,
                        "Stored new release"
                    );
                    metrics::counter!("shinkan_releases_created_total").increment(1);
                    report.releases_created += 1;
                }
                UpsertOutcome::DuplicateIgnored => report.releases_duplicate += 1,
            }
        }

        Ok(())
    }

    async fn persist_work(
        &self,
        item: &NormalizedItem,
        index: &mut CatalogIndex,
    ) -> Result<ItemOutcome, StoreError> {
        match self.dedup.resolve(item, index) {
            MatchDecision::Existing { work_id, .. } if index.is_deleted(work_id) => {
                debug!(work_id = %work_id, title = %item.title, "Matched a deleted work, skipping");
                Ok(ItemOutcome::SkippedDeleted)
            }
            MatchDecision::Existing { work_id, tier } => {
                let work = self
                    .store
                    .corroborate_work(work_id, &corroboration(item))
                    .await?;
                index.upsert(&work);
                Ok(ItemOutcome::Matched(work_id, tier))
            }
            MatchDecision::New => {
                let upserted = self
                    .store
                    .upsert_work_with_outcome(&WorkCandidate {
                        canonical_title: item.title.clone(),
                        alternate_titles: item.alternate_titles.clone(),
                        media_kind: item.media_kind,
                        status: item.status.unwrap_or_default(),
                        external_url: item.external_url.clone(),
                        source_id: item.source_id.clone(),
                    })
                    .await?;
                let id = upserted.id;

                let work: Work = self.store.get_work(id).await?.ok_or(StoreError::NotFound {
                    entity: "work",
                    key: id.to_string(),
                })?;

                if !upserted.created {
                    // Stored by an overlapping run after this run's snapshot.
                    debug!(work_id = %id, title = %item.title, "Work appeared since the snapshot");
                    if work.is_deleted() {
                        index.upsert(&work);
                        return Ok(ItemOutcome::SkippedDeleted);
                    }
                    let work = self
                        .store
                        .corroborate_work(id, &corroboration(item))
                        .await?;
                    index.upsert(&work);
                    return Ok(ItemOutcome::Matched(id, MatchTier::Exact));
                }

                debug!(
                    event = "work_created",
                    work_id = %id,
                    title = %work.canonical_title,
                    kind = %work.media_kind,
                    "Created work"
                );
                index.upsert(&work);
                Ok(ItemOutcome::Created(id))
            }
        }
    }
}

fn corroboration(item: &NormalizedItem) -> Corroboration {
    Corroboration {
        titles: item.titles().map(str::to_string).collect(),
        source_id: item.source_id.clone(),
        status: item.status,
        external_url: item.external_url.clone(),
    }
}

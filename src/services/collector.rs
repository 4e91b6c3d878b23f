use crate::clients::{ResilientSource, SinceMarker, SourceError, SourcedRecord};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Succeeded { count: usize },
    Failed { error: SourceError },
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: SourceOutcome,
    pub duration: Duration,
}

impl SourceReport {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Succeeded { .. })
    }
}

/// Records from every source, concatenated in configured source order,
/// plus one report per source in the same order.
#[derive(Debug, Default)]
pub struct CollectionResult {
    pub records: Vec<SourcedRecord>,
    pub reports: Vec<SourceReport>,
}

impl CollectionResult {
    pub fn succeeded_sources(&self) -> impl Iterator<Item = &str> {
        self.reports
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.source_id.as_str())
    }
}

/// Runs all configured sources with bounded concurrency. A failing or slow
/// source only affects its own report.
pub struct CollectionOrchestrator {
    sources: Vec<Arc<ResilientSource>>,
    max_concurrent: usize,
}

impl CollectionOrchestrator {
    #[must_use]
    pub fn new(sources: Vec<Arc<ResilientSource>>, max_concurrent: usize) -> Self {
        Self {
            sources,
            max_concurrent: max_concurrent.max(1),
        }
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub async fn run(
        &self,
        markers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> CollectionResult {
        let start = Instant::now();

        let tasks = self.sources.iter().enumerate().map(|(idx, source)| {
            let since = markers
                .get(source.id())
                .cloned()
                .map(SinceMarker::from_stored);
            async move {
                let started = Instant::now();
                let result = source.fetch(since.as_ref(), cancel).await;
                (idx, result, started.elapsed())
            }
        });

        let mut finished: Vec<_> = futures::stream::iter(tasks)
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        finished.sort_by_key(|(idx, _, _)| *idx);

        let mut result = CollectionResult::default();
        for (idx, fetched, duration) in finished {
            let source_id = self.sources[idx].id().to_string();
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

            metrics::histogram!("shinkan_source_fetch_duration_seconds", "source" => source_id.clone())
                .record(duration.as_secs_f64());

            let outcome = match fetched {
                Ok(records) => {
                    let count = records.len();
                    info!(
                        event = "source_collected",
                        source = %source_id,
                        records = count,
                        duration_ms,
                        "Source fetch succeeded"
                    );
                    metrics::counter!("shinkan_records_collected_total", "source" => source_id.clone())
                        .increment(count as u64);

                    result
                        .records
                        .extend(records.into_iter().map(|record| SourcedRecord {
                            source_id: source_id.clone(),
                            record,
                        }));
                    SourceOutcome::Succeeded { count }
                }
                Err(error) => {
                    warn!(
                        event = "source_failed",
                        source = %source_id,
                        error = %error,
                        duration_ms,
                        "Source fetch failed"
                    );
                    metrics::counter!("shinkan_source_failures_total", "source" => source_id.clone())
                        .increment(1);
                    SourceOutcome::Failed { error }
                }
            };

            result.reports.push(SourceReport {
                source_id,
                outcome,
                duration,
            });
        }

        info!(
            event = "collection_finished",
            sources = result.reports.len(),
            succeeded = result.succeeded_sources().count(),
            records = result.records.len(),
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Collection complete"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{FeedItem, RawRecord, SourceClient};
    use crate::config::SourceConfig;
    use async_trait::async_trait;

    struct StaticClient {
        titles: Vec<&'static str>,
        delay: Duration,
        error: Option<SourceError>,
    }

    #[async_trait]
    impl SourceClient for StaticClient {
        async fn fetch(&self, _since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError> {
            tokio::time::sleep(self.delay).await;
            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            Ok(self
                .titles
                .iter()
                .map(|t| {
                    RawRecord::Feed(FeedItem {
                        title: (*t).to_string(),
                        link: None,
                        published: None,
                        release_date: None,
                        categories: Vec::new(),
                    })
                })
                .collect())
        }
    }

    fn source(id: &str, client: StaticClient) -> Arc<ResilientSource> {
        let mut config = SourceConfig {
            id: id.to_string(),
            requests_per_minute: 600,
            burst: 10,
            ..SourceConfig::default()
        };
        config.retry.max_retries = 0;
        Arc::new(ResilientSource::new(&config, Arc::new(client)))
    }

    fn titles(result: &CollectionResult) -> Vec<String> {
        result
            .records
            .iter()
            .map(|r| match &r.record {
                RawRecord::Feed(item) => format!("{}:{}", r.source_id, item.title),
                RawRecord::Anilist(a) => format!("{}:{}", r.source_id, a.episode),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_merges_in_source_order_and_isolates_failures() {
        let orchestrator = CollectionOrchestrator::new(
            vec![
                source(
                    "slow",
                    StaticClient {
                        titles: vec!["a1", "a2"],
                        delay: Duration::from_secs(10),
                        error: None,
                    },
                ),
                source(
                    "broken",
                    StaticClient {
                        titles: Vec::new(),
                        delay: Duration::ZERO,
                        error: Some(SourceError::MalformedResponse("HTTP 403".into())),
                    },
                ),
                source(
                    "fast",
                    StaticClient {
                        titles: vec!["b1"],
                        delay: Duration::ZERO,
                        error: None,
                    },
                ),
            ],
            3,
        );

        let result = orchestrator
            .run(&HashMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(titles(&result), vec!["slow:a1", "slow:a2", "fast:b1"]);
        let ids: Vec<_> = result.reports.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "broken", "fast"]);
        assert_eq!(
            result.reports[0].outcome,
            SourceOutcome::Succeeded { count: 2 }
        );
        assert!(!result.reports[1].succeeded());
        assert_eq!(result.succeeded_sources().collect::<Vec<_>>(), vec!["slow", "fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_run_concurrently() {
        let orchestrator = CollectionOrchestrator::new(
            (0..3)
                .map(|i| {
                    source(
                        &format!("s{i}"),
                        StaticClient {
                            titles: vec!["x"],
                            delay: Duration::from_secs(10),
                            error: None,
                        },
                    )
                })
                .collect(),
            3,
        );

        let start = tokio::time::Instant::now();
        let result = orchestrator
            .run(&HashMap::new(), &CancellationToken::new())
            .await;
        assert_eq!(result.records.len(), 3);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let orchestrator = CollectionOrchestrator::new(
            (0..3)
                .map(|i| {
                    source(
                        &format!("s{i}"),
                        StaticClient {
                            titles: vec!["x"],
                            delay: Duration::from_secs(10),
                            error: None,
                        },
                    )
                })
                .collect(),
            1,
        );

        let start = tokio::time::Instant::now();
        orchestrator
            .run(&HashMap::new(), &CancellationToken::new())
            .await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}

//! Upstream adapters and the resilience wrapper every fetch goes through.

pub mod anilist;
pub mod feed;

use crate::config::{SourceConfig, SourceKind};
use crate::resilience::{Admission, CircuitBreaker, RateLimit, RetryPolicy, retry};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use anilist::{AnilistAiring, AnilistClient};
pub use feed::{FeedClient, FeedItem};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, connection failures and 5xx responses.
    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// 4xx responses and bodies that do not parse. Never retried.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Classifies transport errors. Decode failures are malformed, the rest unreachable.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, None)
        } else {
            Self::Unreachable(err.to_string())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited { retry_after }
        } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            Self::Unreachable(format!("HTTP {status}"))
        } else {
            Self::MalformedResponse(format!("HTTP {status}"))
        }
    }
}

/// Reads a `Retry-After` header given in seconds.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Point in time a source last completed a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinceMarker(String);

impl SinceMarker {
    #[must_use]
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(time.to_rfc3339())
    }

    #[must_use]
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.0)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Upstream record in the shape its adapter produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Anilist(AnilistAiring),
    Feed(FeedItem),
}

/// A raw record tagged with the configured source that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedRecord {
    pub source_id: String,
    pub record: RawRecord,
}

/// One upstream request of a fetch that may span several pages.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub since: Option<&'a SinceMarker>,
    /// Starts at 1.
    pub page: u32,
    /// Same for every page of one fetch, so time windows line up across pages.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    pub has_next: bool,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetches announcements published since the marker, or everything
    /// the upstream currently offers when there is none. Rate-limit signals
    /// must come back as [`SourceError::RateLimited`].
    async fn fetch(&self, since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError>;

    /// Exactly one upstream request. Paged adapters override this; the
    /// default serves the whole fetch as a single page.
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<SourcePage, SourceError> {
        Ok(SourcePage {
            records: self.fetch(request.since).await?,
            has_next: false,
        })
    }
}

/// Builds the adapter a source entry names.
pub fn build_client(
    source: &SourceConfig,
    user_agent: &str,
) -> anyhow::Result<Arc<dyn SourceClient>> {
    let timeout = Duration::from_secs(source.request_timeout_seconds);
    let client: Arc<dyn SourceClient> = match source.kind {
        SourceKind::Anilist => Arc::new(AnilistClient::new(
            source.url.as_deref(),
            user_agent,
            timeout,
            source.lookahead_days,
        )),
        SourceKind::Feed => {
            let url = source
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("feed source '{}' has no url", source.id))?;
            Arc::new(FeedClient::new(url, user_agent, timeout))
        }
    };
    Ok(client)
}

/// A source client behind its own limiter, breaker and retry schedule.
pub struct ResilientSource {
    id: String,
    client: Arc<dyn SourceClient>,
    limiter: RateLimit,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilientSource {
    pub fn new(config: &SourceConfig, client: Arc<dyn SourceClient>) -> Self {
        Self {
            id: config.id.clone(),
            client,
            limiter: RateLimit::per_minute(config.requests_per_minute, config.burst),
            breaker: CircuitBreaker::new(&config.breaker),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetches every page, each one through the guards.
    pub async fn fetch(
        &self,
        since: Option<&SinceMarker>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let started_at = Utc::now();
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let request = PageRequest {
                since,
                page,
                started_at,
            };
            let fetched = self.fetch_page(request, cancel).await?;
            records.extend(fetched.records);
            if !fetched.has_next {
                return Ok(records);
            }
            page += 1;
        }
    }

    /// One upstream request through the guards: a limiter token per attempt.
    ///
    /// Transient failures are retried with backoff and count against the
    /// breaker. Rate-limit responses wait `retry_after` (or the next backoff
    /// step) and count as a response, not a failure. Malformed responses
    /// return immediately.
    async fn fetch_page(
        &self,
        request: PageRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SourcePage, SourceError> {
        let mut backoff = self.retry.backoff();
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let admission = self.breaker.admit();
            if let Admission::Rejected { retry_in } = admission {
                debug!(
                    event = "source_short_circuited",
                    source = %self.id,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    "Circuit open, skipping call"
                );
                return Err(SourceError::Unreachable("circuit breaker open".to_string()));
            }
            let is_trial = admission == Admission::Trial;

            if self.limiter.acquire(cancel).await.is_err() {
                if is_trial {
                    self.breaker.abandon_trial();
                }
                return Err(SourceError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(SourceError::Cancelled),
                result = self.client.fetch_page(request) => result,
            };

            let error = match result {
                Ok(page) => {
                    self.breaker.record_success();
                    return Ok(page);
                }
                Err(SourceError::Cancelled) => {
                    if is_trial {
                        self.breaker.abandon_trial();
                    }
                    return Err(SourceError::Cancelled);
                }
                Err(err) => err,
            };

            let delay = match &error {
                SourceError::Unreachable(_) => {
                    if self.breaker.record_failure() {
                        warn!(
                            event = "circuit_opened",
                            source = %self.id,
                            error = %error,
                            "Circuit breaker opened"
                        );
                    }
                    backoff.next_backoff()
                }
                SourceError::RateLimited { retry_after } => {
                    self.breaker.record_success();
                    retry_after.or_else(|| backoff.next_backoff())
                }
                _ => {
                    self.breaker.record_success();
                    return Err(error);
                }
            };

            if retries >= self.retry.max_retries() {
                return Err(error);
            }
            let delay = delay.unwrap_or_else(|| self.retry.max_delay());
            retries += 1;

            warn!(
                event = "source_retry",
                source = %self.id,
                page = request.page,
                attempt = retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying source fetch"
            );

            if retry::sleep_cancellable(delay, cancel).await.is_err() {
                return Err(SourceError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<Vec<RawRecord>, SourceError>>>,
        fallback: Result<Vec<RawRecord>, SourceError>,
    }

    impl ScriptedClient {
        fn new(
            script: Vec<Result<Vec<RawRecord>, SourceError>>,
            fallback: Result<Vec<RawRecord>, SourceError>,
        ) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                fallback,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceClient for ScriptedClient {
        async fn fetch(&self, _since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn timeout() -> SourceError {
        SourceError::Unreachable("timeout".to_string())
    }

    fn source_config(max_retries: u32) -> SourceConfig {
        SourceConfig {
            id: "test".to_string(),
            requests_per_minute: 6000,
            burst: 50,
            breaker: BreakerConfig {
                failure_threshold: 5,
                window_seconds: 120,
                cooldown_seconds: 300,
            },
            retry: RetryConfig {
                max_retries,
                initial_delay_ms: 100,
                max_delay_ms: 1000,
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..SourceConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_short_circuits_and_trials_once() {
        let client = ScriptedClient::new(Vec::new(), Err(timeout()));
        let source = ResilientSource::new(&source_config(0), client.clone());
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            assert_eq!(source.fetch(None, &cancel).await, Err(timeout()));
        }
        assert_eq!(client.calls(), 5);

        // Sixth call inside the cool-down never reaches the client.
        let err = source.fetch(None, &cancel).await.unwrap_err();
        assert!(matches!(err, SourceError::Unreachable(_)));
        assert_eq!(client.calls(), 5);

        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(source.fetch(None, &cancel).await, Err(timeout()));
        assert_eq!(client.calls(), 6);

        // The failed trial re-opened the breaker.
        source.fetch(None, &cancel).await.unwrap_err();
        assert_eq!(client.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let client = ScriptedClient::new(vec![Err(timeout()), Err(timeout())], Ok(Vec::new()));
        let source = ResilientSource::new(&source_config(3), client.clone());
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        assert_eq!(source.fetch(None, &cancel).await, Ok(Vec::new()));
        assert_eq!(client.calls(), 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let client = ScriptedClient::new(Vec::new(), Err(timeout()));
        let source = ResilientSource::new(&source_config(2), client.clone());
        let cancel = CancellationToken::new();

        assert_eq!(source.fetch(None, &cancel).await, Err(timeout()));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_is_not_retried() {
        let malformed = SourceError::MalformedResponse("HTTP 404".to_string());
        let client = ScriptedClient::new(Vec::new(), Err(malformed.clone()));
        let source = ResilientSource::new(&source_config(3), client.clone());
        let cancel = CancellationToken::new();

        assert_eq!(source.fetch(None, &cancel).await, Err(malformed));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_waits_and_does_not_trip_breaker() {
        let limited = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        let client = ScriptedClient::new(
            vec![Err(limited.clone()), Err(limited)],
            Ok(Vec::new()),
        );
        let mut config = source_config(3);
        config.breaker.failure_threshold = 1;
        let source = ResilientSource::new(&config, client.clone());
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        assert_eq!(source.fetch(None, &cancel).await, Ok(Vec::new()));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(source.breaker().phase(), crate::resilience::BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let client = ScriptedClient::new(Vec::new(), Err(timeout()));
        let mut config = source_config(5);
        config.retry.initial_delay_ms = 60_000;
        let source = ResilientSource::new(&config, client.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_eq!(source.fetch(None, &cancel).await, Err(SourceError::Cancelled));
        assert_eq!(client.calls(), 1);
    }

    /// Serves `pages` pages of one record each, failing the scripted pages once.
    struct PagedClient {
        pages: u32,
        fail_once: Mutex<Vec<(u32, SourceError)>>,
        requests: Mutex<Vec<u32>>,
    }

    impl PagedClient {
        fn new(pages: u32, fail_once: Vec<(u32, SourceError)>) -> Arc<Self> {
            Arc::new(Self {
                pages,
                fail_once: Mutex::new(fail_once),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<u32> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceClient for PagedClient {
        async fn fetch(&self, _since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError> {
            unreachable!("paged sources are driven page by page")
        }

        async fn fetch_page(&self, request: PageRequest<'_>) -> Result<SourcePage, SourceError> {
            self.requests.lock().unwrap().push(request.page);
            let mut fail_once = self.fail_once.lock().unwrap();
            if let Some(pos) = fail_once.iter().position(|(p, _)| *p == request.page) {
                return Err(fail_once.remove(pos).1);
            }
            Ok(SourcePage {
                records: vec![RawRecord::Feed(FeedItem {
                    title: format!("Demon Tale Episode {}", request.page),
                    link: None,
                    published: None,
                    release_date: None,
                    categories: Vec::new(),
                })],
                has_next: request.page < self.pages,
            })
        }
    }

    #[tokio::test]
    async fn test_every_page_takes_a_token() {
        let client = PagedClient::new(3, Vec::new());
        let mut config = source_config(0);
        config.requests_per_minute = 1;
        config.burst = 4;
        let source = ResilientSource::new(&config, client.clone());

        let records = source.fetch(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(client.requests(), vec![1, 2, 3]);

        // Three of the four burst tokens are gone.
        assert!(source.limiter.try_acquire());
        assert!(!source.limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_page_is_retried_alone() {
        let limited = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        let client = PagedClient::new(3, vec![(2, limited)]);
        let source = ResilientSource::new(&source_config(3), client.clone());

        let records = source.fetch(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(client.requests(), vec![1, 2, 2, 3]);
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(SourceError::from_status(StatusCode::BAD_GATEWAY, None).is_transient());
        assert_eq!(
            SourceError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            SourceError::from_status(StatusCode::NOT_FOUND, None),
            SourceError::MalformedResponse(_)
        ));
    }

    #[test]
    fn test_since_marker_roundtrip() {
        let now = Utc::now();
        let marker = SinceMarker::at(now);
        assert_eq!(
            marker.as_datetime().map(|dt| dt.timestamp()),
            Some(now.timestamp())
        );
        assert_eq!(SinceMarker::from_stored("garbage".into()).as_datetime(), None);
    }
}

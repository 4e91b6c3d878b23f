//! Integration tests for the notification scheduler against a real store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shinkan::config::NotificationConfig;
use shinkan::db::Store;
use shinkan::domain::{MediaKind, ReleaseId, ReleaseKind, WorkStatus};
use shinkan::models::{Release, ReleaseFields, UpsertOutcome, WorkCandidate};
use shinkan::services::{
    DeliveryReport, DispatchError, NotificationDispatcher, NotificationScheduler,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Records every batch it receives and fails the configured labels.
struct RecordingDispatcher {
    channel: String,
    fail_labels: HashSet<String>,
    omit_labels: HashSet<String>,
    reject_all: bool,
    batches: Mutex<Vec<Vec<ReleaseId>>>,
}

impl RecordingDispatcher {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            fail_labels: HashSet::new(),
            omit_labels: HashSet::new(),
            reject_all: false,
            batches: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, labels: &[&str]) -> Self {
        self.fail_labels = labels.iter().map(|l| (*l).to_string()).collect();
        self
    }

    fn omitting(mut self, labels: &[&str]) -> Self {
        self.omit_labels = labels.iter().map(|l| (*l).to_string()).collect();
        self
    }

    fn rejecting(mut self) -> Self {
        self.reject_all = true;
        self
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    fn sent(&self) -> usize {
        self.batch_sizes().iter().sum()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn dispatch(&self, releases: &[Release]) -> Result<Vec<DeliveryReport>, DispatchError> {
        self.batches
            .lock()
            .unwrap()
            .push(releases.iter().map(|r| r.id).collect());

        if self.reject_all {
            return Err(DispatchError::Rejected { status: 400 });
        }

        Ok(releases
            .iter()
            .filter(|r| !self.omit_labels.contains(&r.label))
            .map(|r| {
                if self.fail_labels.contains(&r.label) {
                    DeliveryReport::failed(r.id, &self.channel, "mailbox full")
                } else {
                    DeliveryReport::delivered(r.id, &self.channel)
                }
            })
            .collect())
    }
}

async fn open_store() -> Store {
    let db_path =
        std::env::temp_dir().join(format!("shinkan-notify-test-{}.db", uuid::Uuid::new_v4()));
    Store::new(&format!("sqlite:{}", db_path.display()))
        .await
        .expect("Failed to open store")
}

/// Seeds `n` pending episodes of one work, all dated 2025-12-10.
async fn seed(store: &Store, n: usize) -> Vec<ReleaseId> {
    let work = store
        .upsert_work(&WorkCandidate {
            canonical_title: "Demon Tale".to_string(),
            alternate_titles: Vec::new(),
            media_kind: MediaKind::SerialVideo,
            status: WorkStatus::Ongoing,
            external_url: None,
            source_id: "anilist".to_string(),
        })
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(n);
    for i in 1..=n {
        let fields = ReleaseFields {
            kind: ReleaseKind::Episode,
            label: i.to_string(),
            channel: "crunchyroll".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 12, 10).unwrap(),
            source_id: "anilist".to_string(),
            source_url: None,
        };
        if let UpsertOutcome::Created(id) = store.upsert_release(work, &fields).await.unwrap() {
            ids.push(id);
        }
    }
    ids
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 10, hour, 30, 0).unwrap()
}

fn scheduler(
    store: &Store,
    config: &NotificationConfig,
    dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
) -> NotificationScheduler {
    NotificationScheduler::new(store.clone(), config, dispatchers).unwrap()
}

async fn pending(store: &Store) -> usize {
    store
        .list_pending_releases(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap())
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_partial_batch_failure_only_touches_failed_items() {
    let store = open_store().await;
    let ids = seed(&store, 10).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log").failing(&["3", "6", "9"]));
    let report = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    )
    .run_once(at(12), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![10]);
    assert_eq!(report.notified, 7);
    assert_eq!(report.failed, 3);

    for id in ids {
        let release = store.get_release(id).await.unwrap().unwrap();
        if ["3", "6", "9"].contains(&release.label.as_str()) {
            assert!(!release.notified, "release {} should stay pending", release.label);
            assert_eq!(release.attempt_count, 1);
            assert_eq!(release.last_error.as_deref(), Some("log: mailbox full"));
        } else {
            assert!(release.notified, "release {} should be notified", release.label);
            assert_eq!(release.attempt_count, 0);
        }
    }
    assert_eq!(pending(&store).await, 3);
}

#[tokio::test]
async fn test_250_pending_go_out_in_three_batches() {
    let store = open_store().await;
    seed(&store, 250).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log"));
    let report = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    )
    .run_once(at(20), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.batches_planned, 3);
    assert_eq!(report.batches_sent, 3);
    assert_eq!(dispatcher.batch_sizes(), vec![100, 75, 75]);
    assert!(dispatcher.batch_sizes().iter().all(|s| *s <= 100));
    assert_eq!(report.notified, 250);
    assert_eq!(pending(&store).await, 0);
}

#[tokio::test]
async fn test_batches_not_yet_due_wait_for_a_later_run() {
    let store = open_store().await;
    seed(&store, 250).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log"));
    let scheduler = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    );

    // 10:30 UTC: only the 08:00 batch is due.
    let report = scheduler
        .run_once(at(10), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(dispatcher.batch_sizes(), vec![100]);
    assert_eq!(report.not_due, 150);
    assert_eq!(pending(&store).await, 150);

    // The 100 sent this morning still count, so the day stays a three-batch plan.
    let report = scheduler
        .run_once(at(20), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.sent_earlier, 100);
    assert_eq!(report.batches_planned, 3);
    assert_eq!(report.batches_sent, 2);
    assert_eq!(dispatcher.batch_sizes(), vec![100, 75, 75]);
    assert_eq!(pending(&store).await, 0);
}

#[tokio::test]
async fn test_hourly_runs_keep_later_slots_for_later() {
    let store = open_store().await;
    seed(&store, 250).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log"));
    let scheduler = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    );

    for hour in 8..=12 {
        scheduler
            .run_once(at(hour), &CancellationToken::new())
            .await
            .unwrap();
    }
    assert_eq!(dispatcher.batch_sizes(), vec![100]);
    assert_eq!(pending(&store).await, 150);

    for hour in 13..=18 {
        scheduler
            .run_once(at(hour), &CancellationToken::new())
            .await
            .unwrap();
    }
    assert_eq!(dispatcher.batch_sizes(), vec![100, 75]);
    assert_eq!(pending(&store).await, 75);

    let report = scheduler
        .run_once(at(19), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.sent_earlier, 175);
    assert_eq!(dispatcher.batch_sizes(), vec![100, 75, 75]);
    assert_eq!(pending(&store).await, 0);
}

#[tokio::test]
async fn test_notified_releases_are_never_sent_again() {
    let store = open_store().await;
    seed(&store, 5).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log"));
    let scheduler = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    );

    scheduler
        .run_once(at(12), &CancellationToken::new())
        .await
        .unwrap();
    let report = scheduler
        .run_once(at(13), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(dispatcher.sent(), 5);
    assert_eq!(report.pending, 0);
    assert_eq!(report.sent_earlier, 5);
    assert_eq!(report.batches_sent, 0);
}

#[tokio::test]
async fn test_missing_report_counts_as_failure() {
    let store = open_store().await;
    seed(&store, 4).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log").omitting(&["2"]));
    let report = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    )
    .run_once(at(12), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.notified, 3);
    assert_eq!(report.failed, 1);
    let left = store
        .list_pending_releases(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].label, "2");
    assert_eq!(left[0].last_error.as_deref(), Some("log: no delivery report"));
}

#[tokio::test]
async fn test_rejected_batches_end_in_review() {
    let store = open_store().await;
    seed(&store, 3).await;

    let config = NotificationConfig {
        max_attempts: 2,
        ..NotificationConfig::default()
    };
    let dispatcher = Arc::new(RecordingDispatcher::new("log").rejecting());
    let scheduler = scheduler(&store, &config, vec![dispatcher.clone()]);

    let first = scheduler
        .run_once(at(12), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.failed, 3);
    assert_eq!(first.flagged_for_review, 0);

    let second = scheduler
        .run_once(at(13), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.flagged_for_review, 3);

    let third = scheduler
        .run_once(at(14), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(third.pending, 0);
    assert_eq!(dispatcher.batch_sizes(), vec![3, 3]);
    assert_eq!(store.review_queue().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_channel_already_delivered_is_skipped() {
    let store = open_store().await;
    seed(&store, 2).await;

    let log = Arc::new(RecordingDispatcher::new("log"));
    let webhook = Arc::new(RecordingDispatcher::new("webhook").failing(&["1"]));
    let scheduler = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![log.clone(), webhook.clone()],
    );

    let first = scheduler
        .run_once(at(12), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.notified, 1);
    assert_eq!(pending(&store).await, 1);

    // Only the webhook still owes release "1".
    scheduler
        .run_once(at(13), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(log.batch_sizes(), vec![2]);
    assert_eq!(webhook.batch_sizes(), vec![2, 1]);
}

#[tokio::test]
async fn test_cancelled_run_sends_nothing() {
    let store = open_store().await;
    seed(&store, 5).await;

    let dispatcher = Arc::new(RecordingDispatcher::new("log"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = scheduler(
        &store,
        &NotificationConfig::default(),
        vec![dispatcher.clone()],
    )
    .run_once(at(12), &cancel)
    .await
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(dispatcher.sent(), 0);
    assert_eq!(pending(&store).await, 5);
}

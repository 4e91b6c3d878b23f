//! Time-bucketed notification of pending releases.
//!
//! Each run recomputes the day's set from the store (releases still pending
//! plus those notified earlier the same day), plans it into one, two or
//! three batches depending on its size and dispatches the batches whose
//! send time has passed. Nothing is kept in memory between runs: a batch
//! that is not yet due is simply planned again next time.

use crate::config::NotificationConfig;
use crate::db::Store;
use crate::domain::ReleaseId;
use crate::models::{DeliveryOutcome, MarkOutcome, NotifyPolicy, Release};
use crate::services::dispatch::NotificationDispatcher;
use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeDelta, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Empty,
    Single,
    Double,
    Triple,
}

impl PlanMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Single => "single",
            Self::Double => "double",
            Self::Triple => "triple",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub send_at: DateTime<Utc>,
    /// Slots of this batch taken by releases notified earlier the same day.
    pub already_sent: usize,
    pub releases: Vec<Release>,
}

impl Batch {
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.send_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub mode: PlanMode,
    pub batches: Vec<Batch>,
    /// Releases beyond the per-batch cap, left for a later run.
    pub deferred: Vec<Release>,
}

impl BatchPlan {
    /// Planned size of each batch, counting slots already used today.
    #[must_use]
    pub fn sizes(&self) -> Vec<usize> {
        self.batches
            .iter()
            .map(|b| b.already_sent + b.releases.len())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlanner {
    single_batch_threshold: usize,
    triple_batch_threshold: usize,
    two_batch: Vec<(NaiveTime, u32)>,
    three_batch: Vec<(NaiveTime, u32)>,
    max_per_batch: usize,
    offset: FixedOffset,
}

impl BatchPlanner {
    pub fn from_config(config: &NotificationConfig) -> anyhow::Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            anyhow::anyhow!("Invalid utc_offset_minutes {}", config.utc_offset_minutes)
        })?;

        Ok(Self {
            single_batch_threshold: config.single_batch_threshold,
            triple_batch_threshold: config.triple_batch_threshold,
            two_batch: slots(config.parsed_two_batch_times()?, &config.two_batch_split),
            three_batch: slots(config.parsed_three_batch_times()?, &config.three_batch_split),
            max_per_batch: config.max_per_batch.max(1),
            offset,
        })
    }

    #[must_use]
    pub const fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The UTC instants bounding the operator's calendar day around `now`.
    #[must_use]
    pub fn day_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.with_timezone(&self.offset).date_naive();
        let start = self
            .offset
            .from_local_datetime(&today.and_time(NaiveTime::MIN))
            .single()
            .map_or(now, |dt| dt.with_timezone(&Utc));
        (start, start + TimeDelta::days(1))
    }

    /// Buckets `pending` into batches. Releases are ordered by (date, id)
    /// first, so earlier releases land in earlier batches.
    #[must_use]
    pub fn plan(&self, pending: Vec<Release>, now: DateTime<Utc>) -> BatchPlan {
        self.plan_day(0, pending, now)
    }

    /// Plans the whole day: `already_sent` releases notified earlier today
    /// count towards the mode and the split and fill the earliest slots, so
    /// a run later in the day keeps the remaining releases in their windows.
    #[must_use]
    pub fn plan_day(
        &self,
        already_sent: usize,
        mut pending: Vec<Release>,
        now: DateTime<Utc>,
    ) -> BatchPlan {
        pending.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        let n = already_sent + pending.len();

        let (mode, slots): (PlanMode, Vec<(DateTime<Utc>, u32)>) = if n == 0 {
            (PlanMode::Empty, Vec::new())
        } else if n < self.single_batch_threshold {
            (PlanMode::Single, vec![(now, 100)])
        } else if n < self.triple_batch_threshold {
            (PlanMode::Double, self.resolve(&self.two_batch, now))
        } else {
            (PlanMode::Triple, self.resolve(&self.three_batch, now))
        };

        let shares: Vec<u32> = slots.iter().map(|(_, share)| *share).collect();
        let sizes = split_sizes(n, &shares);

        let mut sent_left = already_sent;
        let mut rest = pending.into_iter();
        let mut batches = Vec::with_capacity(slots.len());
        let mut deferred = Vec::new();
        for (index, ((send_at, _), size)) in slots.into_iter().zip(sizes).enumerate() {
            let taken = size.min(sent_left);
            sent_left -= taken;

            let room = self.max_per_batch.saturating_sub(taken);
            let mut releases: Vec<Release> = rest.by_ref().take(size - taken).collect();
            if releases.len() > room {
                deferred.extend(releases.split_off(room));
            }
            batches.push(Batch {
                index,
                send_at,
                already_sent: taken,
                releases,
            });
        }
        deferred.extend(rest);

        BatchPlan {
            mode,
            batches,
            deferred,
        }
    }

    /// Today's send times in the operator's offset, as UTC instants.
    fn resolve(&self, slots: &[(NaiveTime, u32)], now: DateTime<Utc>) -> Vec<(DateTime<Utc>, u32)> {
        let today = now.with_timezone(&self.offset).date_naive();
        slots
            .iter()
            .map(|(time, share)| {
                let send_at = self
                    .offset
                    .from_local_datetime(&today.and_time(*time))
                    .single()
                    .map_or(now, |dt| dt.with_timezone(&Utc));
                (send_at, *share)
            })
            .collect()
    }
}

fn slots(mut times: Vec<NaiveTime>, split: &[u32]) -> Vec<(NaiveTime, u32)> {
    times.sort();
    times.into_iter().zip(split.iter().copied()).collect()
}

/// Splits `n` by percentage shares, giving the rounding remainder to the
/// earliest batches one item at a time.
fn split_sizes(n: usize, shares: &[u32]) -> Vec<usize> {
    if shares.is_empty() {
        return Vec::new();
    }
    let total: usize = shares.iter().map(|s| *s as usize).sum();
    let mut sizes: Vec<usize> = if total == 0 {
        vec![n / shares.len(); shares.len()]
    } else {
        shares.iter().map(|s| n * (*s as usize) / total).collect()
    };

    let assigned: usize = sizes.iter().sum();
    for size in sizes.iter_mut().take(n - assigned) {
        *size += 1;
    }
    sizes
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub pending: usize,
    /// Releases notified earlier the same day that still shape the plan.
    pub sent_earlier: usize,
    pub batches_planned: usize,
    pub batches_sent: usize,
    /// Releases that reached delivery on every required channel.
    pub notified: usize,
    pub failed: usize,
    pub flagged_for_review: usize,
    pub deferred: usize,
    pub not_due: usize,
    pub cancelled: bool,
}

pub struct NotificationScheduler {
    store: Store,
    planner: BatchPlanner,
    dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
    max_attempts: u32,
    lookahead_days: u32,
}

impl NotificationScheduler {
    pub fn new(
        store: Store,
        config: &NotificationConfig,
        dispatchers: Vec<Arc<dyn NotificationDispatcher>>,
    ) -> anyhow::Result<Self> {
        if dispatchers.is_empty() {
            anyhow::bail!("At least one notification dispatcher is required");
        }
        Ok(Self {
            store,
            planner: BatchPlanner::from_config(config)?,
            dispatchers,
            max_attempts: config.max_attempts,
            lookahead_days: config.lookahead_days,
        })
    }

    fn policy(&self) -> NotifyPolicy {
        NotifyPolicy {
            required_channels: self
                .dispatchers
                .iter()
                .map(|d| d.channel().to_string())
                .collect(),
            max_attempts: self.max_attempts,
        }
    }

    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<NotifyReport> {
        let start = std::time::Instant::now();
        let today = now.with_timezone(&self.planner.offset()).date_naive();
        let as_of = today
            .checked_add_days(Days::new(u64::from(self.lookahead_days)))
            .unwrap_or(today);

        let (day_start, day_end) = self.planner.day_bounds(now);
        let sent_earlier = self
            .store
            .count_notified_between(day_start, day_end)
            .await?;
        let sent_earlier = usize::try_from(sent_earlier).unwrap_or(usize::MAX);

        let pending = self.store.list_pending_releases(as_of).await?;
        let pending_count = pending.len();
        let plan = self.planner.plan_day(sent_earlier, pending, now);

        let mut report = NotifyReport {
            pending: pending_count,
            sent_earlier,
            batches_planned: plan.batches.len(),
            deferred: plan.deferred.len(),
            ..NotifyReport::default()
        };

        info!(
            event = "notification_plan",
            mode = plan.mode.as_str(),
            pending = report.pending,
            sent_earlier = report.sent_earlier,
            sizes = ?plan.sizes(),
            deferred = report.deferred,
            "Planned notification batches"
        );

        let policy = self.policy();
        for batch in &plan.batches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if batch.releases.is_empty() {
                continue;
            }
            if !batch.is_due(now) {
                report.not_due += batch.releases.len();
                continue;
            }

            self.send_batch(batch, &policy, now, &mut report).await?;
            report.batches_sent += 1;
        }

        info!(
            event = "notification_run_finished",
            notified = report.notified,
            failed = report.failed,
            flagged_for_review = report.flagged_for_review,
            not_due = report.not_due,
            cancelled = report.cancelled,
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Notification run finished"
        );

        Ok(report)
    }

    async fn send_batch(
        &self,
        batch: &Batch,
        policy: &NotifyPolicy,
        now: DateTime<Utc>,
        report: &mut NotifyReport,
    ) -> anyhow::Result<()> {
        let ids: Vec<ReleaseId> = batch.releases.iter().map(|r| r.id).collect();
        let delivered = self.store.delivered_channels(&ids).await?;

        for dispatcher in &self.dispatchers {
            let channel = dispatcher.channel();
            let to_send: Vec<Release> = batch
                .releases
                .iter()
                .filter(|r| !delivered.get(&r.id).is_some_and(|c| c.contains(channel)))
                .cloned()
                .collect();
            if to_send.is_empty() {
                continue;
            }

            let outcomes: Vec<(ReleaseId, DeliveryOutcome)> = match dispatcher.dispatch(&to_send).await
            {
                Ok(reports) => {
                    let mut by_id: HashMap<ReleaseId, DeliveryOutcome> = reports
                        .into_iter()
                        .filter(|r| r.channel == channel)
                        .map(|r| (r.release_id, r.outcome))
                        .collect();
                    to_send
                        .iter()
                        .map(|r| {
                            let outcome = by_id.remove(&r.id).unwrap_or_else(|| {
                                DeliveryOutcome::Failed("no delivery report".to_string())
                            });
                            (r.id, outcome)
                        })
                        .collect()
                }
                Err(e) => {
                    warn!(
                        event = "dispatch_failed",
                        channel,
                        batch = batch.index,
                        size = to_send.len(),
                        error = %e,
                        "Dispatcher failed the whole batch"
                    );
                    to_send
                        .iter()
                        .map(|r| (r.id, DeliveryOutcome::Failed(e.to_string())))
                        .collect()
                }
            };

            for (id, outcome) in outcomes {
                let marked = self
                    .store
                    .mark_notified_at(id, channel, &outcome, policy, now)
                    .await?;
                tally(report, channel, id, marked);
            }
        }

        Ok(())
    }
}

fn tally(report: &mut NotifyReport, channel: &str, id: ReleaseId, marked: MarkOutcome) {
    let label = match marked {
        MarkOutcome::Delivered { complete } => {
            if complete {
                report.notified += 1;
            }
            "delivered"
        }
        MarkOutcome::AlreadyRecorded => "already_recorded",
        MarkOutcome::Failed {
            attempts,
            needs_review,
        } => {
            report.failed += 1;
            if needs_review {
                report.flagged_for_review += 1;
                warn!(
                    event = "release_needs_review",
                    release_id = %id,
                    channel,
                    attempts,
                    "Release exceeded delivery attempts"
                );
            }
            "failed"
        }
    };
    metrics::counter!(
        "shinkan_notifications_total",
        "channel" => channel.to_string(),
        "outcome" => label
    )
    .increment(1);
}

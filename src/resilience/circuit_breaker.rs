//! Circuit breaker guarding one upstream source.
//!
//! Closed: calls pass; failures are remembered for a rolling window and a
//! success forgets them. `failure_threshold` failures inside the window open
//! the breaker. Open: calls are rejected without touching the network until
//! the cool-down ends. Half-open: exactly one trial call is admitted; its
//! success closes the breaker and its failure opens it again.

use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial; its result must be reported.
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: usize,
    window: Duration,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: usize::try_from(config.failure_threshold.max(1)).unwrap_or(1),
            window: Duration::from_secs(config.window_seconds),
            cooldown: Duration::from_secs(config.cooldown_seconds),
            state: Mutex::new(State::Closed {
                failures: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a call may go out now.
    pub fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock();

        match *state {
            State::Closed { .. } => Admission::Allowed,
            State::Open { until } if now < until => Admission::Rejected {
                retry_in: until - now,
            },
            State::Open { .. } => {
                *state = State::HalfOpen;
                Admission::Trial
            }
            State::HalfOpen => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
        }
    }

    pub fn record_success(&self) {
        *self.lock() = State::Closed {
            failures: VecDeque::new(),
        };
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();

        match &mut *state {
            State::Closed { failures } => {
                while failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.window)
                {
                    failures.pop_front();
                }
                failures.push_back(now);

                if failures.len() >= self.failure_threshold {
                    *state = State::Open {
                        until: now + self.cooldown,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                *state = State::Open {
                    until: now + self.cooldown,
                };
                true
            }
            State::Open { .. } => false,
        }
    }

    /// Gives back an unreported half-open trial so the next call can take it.
    pub fn abandon_trial(&self) {
        let mut state = self.lock();
        if matches!(*state, State::HalfOpen) {
            *state = State::Open {
                until: Instant::now(),
            };
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        match *self.lock() {
            State::Closed { .. } => BreakerPhase::Closed,
            State::Open { .. } => BreakerPhase::Open,
            State::HalfOpen => BreakerPhase::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: 3,
            window_seconds: 60,
            cooldown_seconds: 300,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker();
        assert!(!b.record_failure());
        assert!(!b.record_failure());
        assert!(b.record_failure());
        assert_eq!(b.phase(), BreakerPhase::Open);
        assert!(matches!(b.admit(), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert!(!b.record_failure());
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!b.record_failure());
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_half_open_trial() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(300)).await;

        assert_eq!(b.admit(), Admission::Trial);
        assert_eq!(b.phase(), BreakerPhase::HalfOpen);
        assert!(matches!(b.admit(), Admission::Rejected { .. }));

        b.record_success();
        assert_eq!(b.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(b.admit(), Admission::Trial);
        assert!(b.record_failure());

        match b.admit() {
            Admission::Rejected { retry_in } => assert_eq!(retry_in, Duration::from_secs(300)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_given_back() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(b.admit(), Admission::Trial);
        b.abandon_trial();
        assert_eq!(b.admit(), Admission::Trial);
    }
}

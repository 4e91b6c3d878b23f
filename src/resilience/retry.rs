use super::Cancelled;
use crate::config::RetryConfig;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff schedule for transient source failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max
    }

    /// Fresh schedule for one fetch. Retries are bounded by count, not elapsed time.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            max_interval: self.max,
            multiplier: self.multiplier,
            randomization_factor: self.jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Sleeps for `delay` unless the token fires first.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
            jitter: 0.0,
        })
    }

    #[test]
    fn test_schedule_grows_and_caps() {
        let mut backoff = policy().backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        sleep_cancellable(Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = sleep_cancellable(Duration::from_secs(60), &cancel).await;
        assert_eq!(result, Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}

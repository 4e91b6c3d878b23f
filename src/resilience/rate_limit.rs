use super::Cancelled;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio_util::sync::CancellationToken;

/// Token bucket sized from a per-minute budget. An empty bucket suspends the
/// caller until a token frees up; it never fails the call.
pub struct RateLimit {
    limiter: DefaultDirectRateLimiter,
}

impl RateLimit {
    #[must_use]
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rate).allow_burst(burst);

        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Cancelled),
            () = self.limiter.until_ready() => Ok(()),
        }
    }
}

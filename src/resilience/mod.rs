//! Per-source guards applied around every upstream call: a token-bucket
//! limiter, a circuit breaker and exponential retry. Every wait is cancellable.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{Admission, BreakerPhase, CircuitBreaker};
pub use rate_limit::RateLimit;
pub use retry::RetryPolicy;

/// A suspension was interrupted by the run's cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

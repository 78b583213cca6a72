//! Resilience primitives for the Vigil analysis coordinator.
//!
//! Every external call the coordinator makes (provider feeds, the analysis
//! engine, the persistent store) goes through one of these:
//!
//! - [`retry`] -- [`with_retry`] with exponential backoff and additive
//!   jitter, classifying failures as retryable or fatal
//! - [`rate_limit`] -- [`SlidingWindowLimiter`], a per-identifier sliding
//!   window with a bounded identifier cache and periodic sweep
//! - [`clock`] -- injectable time sources for deterministic tests
//! - [`error`] -- typed failures carrying a retry-after
//!
//! [`with_retry`]: retry::with_retry
//! [`SlidingWindowLimiter`]: rate_limit::SlidingWindowLimiter

pub mod clock;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ResilienceError, RetryError};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, SlidingWindowLimiter};
pub use retry::{ErrorClass, RetryPolicy, TransientSignal, with_retry};

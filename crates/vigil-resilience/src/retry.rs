//! Exponential backoff with additive jitter.
//!
//! [`with_retry`] runs an async operation, classifies each failure as
//! retryable or fatal, and sleeps between retryable failures. The delay
//! before retry `n` (0-indexed) is
//! `min(base_delay_ms * 2^n + random(0..=jitter_ms), max_delay_ms)`.
//! Total attempts are `max_retries + 1` and there is no sleep after the
//! final attempt.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::RetryError;

/// Lowercase fragments that mark an error message as a transport failure.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "etimedout",
    "econnrefused",
    "network",
    "aborted",
    "broken pipe",
    "socket hang up",
    "temporarily unavailable",
];

/// Retry policy for external calls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds, doubled per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the uniform jitter added to each delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// HTTP status codes treated as transient.
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter_ms() -> u64 {
    1_000
}

fn default_retryable_statuses() -> BTreeSet<u16> {
    [408, 425, 429, 500, 502, 503, 504].into_iter().collect()
}

impl RetryPolicy {
    /// A policy that never sleeps; used where retries must be immediate.
    #[must_use]
    pub const fn without_delay(mut self) -> Self {
        self.base_delay_ms = 0;
        self.max_delay_ms = 0;
        self.jitter_ms = 0;
        self
    }

    /// Delay before retry `attempt` (0-indexed) for a given jitter sample.
    pub fn backoff_delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exponential = self.base_delay_ms.saturating_mul(factor);
        let total = exponential.saturating_add(jitter_ms).min(self.max_delay_ms);
        Duration::from_millis(total)
    }

    /// Delay before retry `attempt` with a freshly sampled jitter.
    pub fn sample_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.backoff_delay(attempt, jitter)
    }

    /// Classify an error against this policy.
    pub fn classify<E: TransientSignal + ?Sized>(&self, error: &E) -> ErrorClass {
        if error
            .status_code()
            .is_some_and(|code| self.retryable_statuses.contains(&code))
        {
            return ErrorClass::Retryable;
        }
        if error.is_transport_failure() {
            return ErrorClass::Retryable;
        }
        let message = error.to_string().to_ascii_lowercase();
        if TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig)) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}

/// Whether an error may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, resets, rate limiting, upstream 5xx.
    Retryable,
    /// Malformed input and non-transient rejections.
    Fatal,
}

/// Errors that expose enough detail to be classified for retry.
///
/// The message text is always consulted for network/timeout/abort
/// signatures, so the default methods are enough for plain errors.
pub trait TransientSignal: std::fmt::Display {
    /// HTTP-style status code, if the failure carried one.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Whether the failure is known to come from the transport layer.
    fn is_transport_failure(&self) -> bool {
        false
    }

    /// Minimum wait the failure itself asks for, such as a limiter's
    /// retry-after. Backoff never sleeps for less.
    fn retry_after_hint(&self) -> Option<Duration> {
        None
    }
}

/// Run `operation`, retrying retryable failures under `policy`.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] on the first non-retryable failure, or
/// [`RetryError::Exhausted`] carrying the last error once every attempt
/// has failed.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientSignal,
{
    let mut attempt: u32 = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if policy.classify(&error) == ErrorClass::Fatal {
            debug!(attempt, error = %error, "non-retryable failure");
            return Err(RetryError::Fatal(error));
        }

        let hint = error.retry_after_hint().unwrap_or_default();
        if attempt >= policy.max_retries {
            let attempts = attempt.saturating_add(1);
            warn!(attempts, error = %error, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts,
                retry_after: policy.backoff_delay(attempt, 0).max(hint),
                source: error,
            });
        }

        let delay = policy.sample_delay(attempt).max(hint);
        warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "retryable failure, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ResilienceError;
    use crate::rate_limit::{RateLimitPolicy, SlidingWindowLimiter};

    #[derive(Debug)]
    struct TestError {
        status: Option<u16>,
        message: &'static str,
        hint: Option<Duration>,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl TransientSignal for TestError {
        fn status_code(&self) -> Option<u16> {
            self.status
        }

        fn retry_after_hint(&self) -> Option<Duration> {
            self.hint
        }
    }

    const fn unavailable() -> TestError {
        TestError {
            status: Some(503),
            message: "service unavailable",
            hint: None,
        }
    }

    const fn bad_request() -> TestError {
        TestError {
            status: Some(400),
            message: "malformed game id",
            hint: None,
        }
    }

    #[test]
    fn classifies_status_codes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify(&unavailable()), ErrorClass::Retryable);
        assert_eq!(policy.classify(&bad_request()), ErrorClass::Fatal);
    }

    #[test]
    fn classifies_network_signatures() {
        let policy = RetryPolicy::default();
        let err = TestError {
            status: None,
            message: "request Timed Out after 5s",
            hint: None,
        };
        assert_eq!(policy.classify(&err), ErrorClass::Retryable);
        let err = TestError {
            status: None,
            message: "ECONNRESET while reading body",
            hint: None,
        };
        assert_eq!(policy.classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0, 0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1, 0), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2, 50), Duration::from_millis(450));
        assert_eq!(policy.backoff_delay(4, 0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(80, 0), Duration::from_millis(1_000));
    }

    #[test]
    fn sampled_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            jitter_ms: 1_000,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.sample_delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1_100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = Arc::clone(&calls);
        let result = with_retry(&policy, || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(unavailable()) } else { Ok("analyzed") }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "analyzed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(&policy, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(bad_request())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error_with_retry_after() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            ..RetryPolicy::default()
        };

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(&policy, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(400)));
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.inner().status, Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn no_sleep_after_final_attempt() {
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..RetryPolicy::default()
        };
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_retry(&policy, || async { Err(unavailable()) }).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_at_least_the_hinted_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            base_delay_ms: 100,
            jitter_ms: 0,
            ..RetryPolicy::default()
        };

        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();
        let result = with_retry(&policy, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError {
                        status: Some(429),
                        message: "slow down",
                        hint: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_refusal_carries_its_reset_into_exhaustion() {
        let limiter = SlidingWindowLimiter::with_clock(
            RateLimitPolicy {
                max_requests: 1,
                window_ms: 60_000,
                ..RateLimitPolicy::default()
            },
            Arc::new(ManualClock::new(0)),
        );
        assert!(limiter.check("engine").allowed);

        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 100,
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let limiter = &limiter;
        let result: Result<_, RetryError<ResilienceError>> =
            with_retry(&policy, || async move { limiter.acquire("engine") }).await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(60_000)));
    }
}

//! Error types for the resilience primitives.
//!
//! Both variants that reach callers carry a computed retry-after so the
//! operator surface can say "try again in N seconds".

use std::time::Duration;

use crate::retry::TransientSignal;

/// Failure returned by [`with_retry`](crate::retry::with_retry).
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error classified as non-retryable.
    #[error("non-retryable failure: {0}")]
    Fatal(#[source] E),

    /// Every allowed attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts, retry in {}ms: {source}", .retry_after.as_millis())]
    Exhausted {
        /// Total attempts made (`max_retries + 1`).
        attempts: u32,
        /// Suggested wait before the caller tries again.
        retry_after: Duration,
        /// The last observed error.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error, discarding retry metadata.
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(source) | Self::Exhausted { source, .. } => source,
        }
    }

    /// Borrow the underlying error.
    pub const fn inner(&self) -> &E {
        match self {
            Self::Fatal(source) | Self::Exhausted { source, .. } => source,
        }
    }

    /// Suggested wait, present only when retries were exhausted.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Fatal(_) => None,
            Self::Exhausted { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Errors raised by the local rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// The identifier has used up its window.
    #[error("rate limited: {identifier} may retry in {retry_after_ms}ms")]
    RateLimited {
        /// The limited identifier.
        identifier: String,
        /// Milliseconds until the oldest request leaves the window.
        retry_after_ms: u64,
    },
}

impl ResilienceError {
    /// Milliseconds the caller should wait.
    pub const fn retry_after_ms(&self) -> u64 {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

impl TransientSignal for ResilienceError {
    fn status_code(&self) -> Option<u16> {
        Some(429)
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.retry_after_ms()))
    }
}

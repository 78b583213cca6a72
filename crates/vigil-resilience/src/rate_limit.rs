//! Sliding-window rate limiter with a bounded identifier cache.
//!
//! Each identifier keeps the timestamps of its recent requests. A check
//! prunes timestamps at least a full window old, then admits the request if the
//! remaining count is below `max_requests`.
//!
//! Memory is bounded two ways: at most `max_cache_size` identifiers are
//! tracked (the oldest-inserted one is evicted to make room, which is
//! insertion order rather than true LRU), and a periodic sweep drops
//! identifiers whose window has emptied.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::ResilienceError;

/// Sliding-window limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests admitted per identifier per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum number of identifiers tracked at once.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Interval between sweeps of empty identifiers.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            max_cache_size: default_max_cache_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

const fn default_max_requests() -> u32 {
    30
}

const fn default_window_ms() -> u64 {
    60_000
}

const fn default_max_cache_size() -> usize {
    10_000
}

const fn default_sweep_interval_ms() -> u64 {
    60_000
}

/// Outcome of a single [`SlidingWindowLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted (and recorded).
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Milliseconds until the oldest request in the window expires.
    /// Zero when the request was admitted.
    pub reset_in_ms: u64,
}

impl RateLimitDecision {
    /// Turn a denial into a typed error.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimited`] when the request was denied.
    pub fn into_result(self, identifier: &str) -> Result<Self, ResilienceError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ResilienceError::RateLimited {
                identifier: identifier.to_owned(),
                retry_after_ms: self.reset_in_ms,
            })
        }
    }
}

/// Request timestamps for one identifier.
#[derive(Debug)]
struct Entry {
    /// Insertion sequence number, matched against the eviction queue.
    seq: u64,
    hits: Vec<u64>,
}

#[derive(Debug, Default)]
struct LimiterInner {
    entries: HashMap<String, Entry>,
    /// Insertion order. May hold stale pairs for swept identifiers; a pair
    /// is live only while its sequence matches the entry's.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl LimiterInner {
    /// Evict oldest-inserted identifiers until one more fits.
    fn make_room(&mut self, capacity: usize) {
        while self.entries.len() >= capacity {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                self.entries.remove(&key);
                debug!(identifier = key, "evicted rate-limit entry at capacity");
            }
        }
    }

    /// Run `f` on the entry for `identifier`, inserting one if absent.
    fn with_entry<R>(
        &mut self,
        identifier: &str,
        capacity: usize,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        if let Some(entry) = self.entries.get_mut(identifier) {
            return f(entry);
        }
        self.make_room(capacity);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.order.push_back((seq, identifier.to_owned()));
        let entry = self.entries.entry(identifier.to_owned()).or_insert(Entry {
            seq,
            hits: Vec::new(),
        });
        f(entry)
    }
}

/// A per-identifier sliding-window rate limiter.
#[derive(Debug)]
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
    policy: RateLimitPolicy,
    clock: C,
    inner: Mutex<LimiterInner>,
}

impl SlidingWindowLimiter<SystemClock> {
    /// Create a limiter reading the system clock.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> SlidingWindowLimiter<C> {
    /// Create a limiter reading an injected clock.
    pub fn with_clock(policy: RateLimitPolicy, clock: C) -> Self {
        Self {
            policy,
            clock,
            inner: Mutex::new(LimiterInner::default()),
        }
    }

    /// The active policy.
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, LimiterInner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> usize {
        self.policy.max_cache_size.max(1)
    }

    /// Check and, if admitted, record one request for `identifier`.
    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let window = self.policy.window_ms;
        let floor = now.saturating_sub(window);
        let max = self.policy.max_requests;
        let capacity = self.capacity();

        self.lock().with_entry(identifier, capacity, |entry| {
            entry.hits.retain(|&t| t > floor);

            let count = u32::try_from(entry.hits.len()).unwrap_or(u32::MAX);
            if count < max {
                entry.hits.push(now);
                RateLimitDecision {
                    allowed: true,
                    remaining: max.saturating_sub(count.saturating_add(1)),
                    reset_in_ms: 0,
                }
            } else {
                let oldest = entry.hits.iter().min().copied().unwrap_or(now);
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_in_ms: oldest.saturating_add(window).saturating_sub(now),
                }
            }
        })
    }

    /// Like [`check`](Self::check) but denial becomes an error.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimited`] when the window is full.
    pub fn acquire(&self, identifier: &str) -> Result<RateLimitDecision, ResilienceError> {
        self.check(identifier).into_result(identifier)
    }

    /// Honor an upstream rate limit locally.
    ///
    /// Fills the identifier's window to capacity with timestamps placed so
    /// that every local check reports blocked for `retry_after_secs`.
    pub fn record_external_limit(&self, identifier: &str, retry_after_secs: u64) {
        let now = self.clock.now_ms();
        let until = now.saturating_add(retry_after_secs.saturating_mul(1_000));
        let stamp = until.saturating_sub(self.policy.window_ms);
        let fill = usize::try_from(self.policy.max_requests).unwrap_or(usize::MAX);
        let capacity = self.capacity();

        self.lock()
            .with_entry(identifier, capacity, |entry| entry.hits = vec![stamp; fill]);
        debug!(identifier, retry_after_secs, "recorded upstream rate limit");
    }

    /// Drop identifiers whose window is empty. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let floor = self.clock.now_ms().saturating_sub(self.policy.window_ms);
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| {
            entry.hits.retain(|&t| t > floor);
            !entry.hits.is_empty()
        });
        let LimiterInner { entries, order, .. } = &mut *inner;
        order.retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
        before.saturating_sub(inner.entries.len())
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.lock().entries.len()
    }
}

impl<C: Clock + 'static> SlidingWindowLimiter<C> {
    /// Spawn the periodic sweep. The task ends once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = Duration::from_millis(self.policy.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    return;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, tracked = limiter.tracked(), "rate-limit sweep");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: u32, window_ms: u64, max_cache_size: usize) -> SlidingWindowLimiter<Arc<ManualClock>> {
        let policy = RateLimitPolicy {
            max_requests,
            window_ms,
            max_cache_size,
            sweep_interval_ms: 60_000,
        };
        SlidingWindowLimiter::with_clock(policy, Arc::new(ManualClock::new(1_000_000)))
    }

    #[test]
    fn fourth_request_in_window_is_denied() {
        let limiter = limiter(3, 60_000, 100);
        let mut allowed = Vec::new();
        for _ in 0..4 {
            allowed.push(limiter.check("ip-1").allowed);
            limiter.clock.advance(Duration::from_millis(200));
        }
        assert_eq!(allowed, vec![true, true, true, false]);

        limiter.clock.advance(Duration::from_millis(60_000));
        assert!(limiter.check("ip-1").allowed);
    }

    #[test]
    fn waiting_reset_in_ms_reopens_the_window() {
        let limiter = limiter(3, 60_000, 100);
        for _ in 0..3 {
            assert!(limiter.check("ip-1").allowed);
        }
        let denied = limiter.check("ip-1");
        assert!(!denied.allowed);
        assert_eq!(denied.reset_in_ms, 60_000);

        limiter.clock.advance(Duration::from_millis(denied.reset_in_ms));
        assert!(limiter.check("ip-1").allowed);
    }

    #[test]
    fn repeat_checks_reuse_the_existing_entry() {
        let limiter = limiter(2, 60_000, 2);
        limiter.check("a");
        limiter.check("b");
        // Hitting "a" again must not count as a new insertion.
        limiter.check("a");
        assert_eq!(limiter.tracked(), 2);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter(3, 60_000, 100);
        assert_eq!(limiter.check("a").remaining, 2);
        assert_eq!(limiter.check("a").remaining, 1);
        assert_eq!(limiter.check("a").remaining, 0);
        let denied = limiter.check("a");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn reset_is_measured_from_oldest_request() {
        let limiter = limiter(2, 10_000, 100);
        limiter.check("a");
        limiter.clock.advance(Duration::from_millis(3_000));
        limiter.check("a");
        limiter.clock.advance(Duration::from_millis(1_000));
        let denied = limiter.check("a");
        assert!(!denied.allowed);
        assert_eq!(denied.reset_in_ms, 6_000);
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = limiter(1, 60_000, 100);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn tracked_identifiers_never_exceed_capacity() {
        let limiter = limiter(5, 60_000, 3);
        for i in 0..50 {
            limiter.check(&format!("id-{}", i % 7));
            assert!(limiter.tracked() <= 3);
        }
    }

    #[test]
    fn eviction_follows_insertion_order() {
        let limiter = limiter(1, 60_000, 2);
        limiter.check("first");
        limiter.check("second");
        limiter.check("third");
        // "first" was evicted, so it starts with a fresh window.
        assert!(limiter.check("first").allowed);
        assert!(!limiter.check("third").allowed);
    }

    #[test]
    fn sweep_drops_idle_identifiers() {
        let limiter = limiter(3, 1_000, 100);
        limiter.check("a");
        limiter.check("b");
        limiter.clock.advance(Duration::from_millis(500));
        limiter.check("b");
        limiter.clock.advance(Duration::from_millis(700));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn external_limit_blocks_until_retry_after() {
        let limiter = limiter(3, 60_000, 100);
        limiter.record_external_limit("lichess", 30);

        let denied = limiter.check("lichess");
        assert!(!denied.allowed);
        assert_eq!(denied.reset_in_ms, 30_000);

        limiter.clock.advance(Duration::from_millis(29_999));
        assert!(!limiter.check("lichess").allowed);
        limiter.clock.advance(Duration::from_millis(2));
        assert!(limiter.check("lichess").allowed);
    }

    #[test]
    fn acquire_reports_retry_after() {
        let limiter = limiter(1, 5_000, 100);
        assert!(limiter.acquire("a").is_ok());
        let err = limiter.acquire("a").unwrap_err();
        assert_eq!(err.retry_after_ms(), 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_limiter_dropped() {
        let limiter = Arc::new(limiter(1, 1_000, 10));
        let handle = limiter.spawn_sweeper();
        drop(limiter);
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

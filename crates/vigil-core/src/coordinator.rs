//! Advisory lock between the autonomous loop and manual sessions.
//!
//! A manual session calls [`LockCoordinator::acquire`] before using the
//! engine and [`LockCoordinator::release`] when done. Acquisition pauses
//! the loop (if it was running unpaused), raises the local bit of the
//! shared [`LockSignal`], and writes a persisted [`LockRecord`] so other
//! processes can see the hold. Release undoes exactly what acquisition
//! did and nothing more.
//!
//! Every transition runs under one async mutex, so a second acquire can
//! never interleave with an in-flight release. Persistence is best-effort:
//! a failed or slow write is logged and coordination continues.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vigil_types::{LockRecord, LockSnapshot, OwnerId};

use crate::cancel::CancelToken;
use crate::pubsub::{Subscribers, Subscription};
use crate::store::RecordStore;

/// Tuning for the lock coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LockPolicy {
    /// Storage key of the persisted lock record.
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// Wait after requesting a pause, giving the loop time to reach a safe point.
    #[serde(default = "default_settle_ms")]
    pub pause_settle_ms: u64,

    /// Wait after release before resuming the loop.
    #[serde(default = "default_settle_ms")]
    pub release_settle_ms: u64,

    /// Budget for one persisted write.
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// Lifetime of a persisted hold as seen by other processes. Zero disables expiry.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How often the remote watcher reads the persisted record.
    #[serde(default = "default_remote_poll_ms")]
    pub remote_poll_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_key: default_lock_key(),
            pause_settle_ms: default_settle_ms(),
            release_settle_ms: default_settle_ms(),
            persist_timeout_ms: default_persist_timeout_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            remote_poll_ms: default_remote_poll_ms(),
        }
    }
}

fn default_lock_key() -> String {
    "analysis_engine".to_owned()
}

const fn default_settle_ms() -> u64 {
    100
}

const fn default_persist_timeout_ms() -> u64 {
    2_000
}

const fn default_lock_ttl_secs() -> u64 {
    600
}

const fn default_remote_poll_ms() -> u64 {
    5_000
}

#[derive(Debug, Default)]
struct SignalBits {
    local: AtomicBool,
    remote: AtomicBool,
}

/// Shared view of whether a manual session holds the engine.
///
/// The coordinator writes it; the evolution loop reads it at every tick
/// and safe point. `local` is this process's hold, `remote` is an
/// unexpired hold persisted by another process.
#[derive(Debug, Clone, Default)]
pub struct LockSignal {
    bits: Arc<SignalBits>,
}

impl LockSignal {
    /// A signal with no holder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any holder, local or remote, is present.
    pub fn is_held(&self) -> bool {
        self.is_local() || self.is_remote()
    }

    /// Whether this process holds the lock.
    pub fn is_local(&self) -> bool {
        self.bits.local.load(Ordering::Acquire)
    }

    /// Whether another process holds the lock.
    pub fn is_remote(&self) -> bool {
        self.bits.remote.load(Ordering::Acquire)
    }

    /// Set the local bit.
    pub fn set_local(&self, held: bool) {
        self.bits.local.store(held, Ordering::Release);
    }

    /// Set the remote bit. Returns the previous value.
    pub fn set_remote(&self, held: bool) -> bool {
        self.bits.remote.swap(held, Ordering::AcqRel)
    }
}

/// The part of the evolution loop the coordinator drives.
pub trait LoopControl: Send + Sync + 'static {
    /// Whether the loop is started.
    fn is_running(&self) -> bool;
    /// Whether the loop is started but paused.
    fn is_paused(&self) -> bool;
    /// Move Running to Paused. No-op otherwise.
    fn request_pause(&self);
    /// Move Paused to Running. No-op otherwise.
    fn request_resume(&self);
}

#[derive(Debug)]
struct Holding {
    token: CancelToken,
    was_running: bool,
    was_paused: bool,
    paused_by_us: bool,
    acquired_at: Instant,
}

/// Arbitrates engine access between the loop and manual sessions.
pub struct LockCoordinator<L, S> {
    control: Arc<L>,
    store: Arc<S>,
    policy: LockPolicy,
    signal: LockSignal,
    owner: OwnerId,
    gate: tokio::sync::Mutex<()>,
    holding: Mutex<Option<Holding>>,
    listeners: Subscribers<bool>,
}

impl<L, S> std::fmt::Debug for LockCoordinator<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("owner", &self.owner)
            .field("policy", &self.policy)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl<L: LoopControl, S: RecordStore> LockCoordinator<L, S> {
    /// Create a coordinator driving `control` and persisting through `store`.
    pub fn new(control: Arc<L>, store: Arc<S>, signal: LockSignal, policy: LockPolicy) -> Self {
        Self {
            control,
            store,
            policy,
            signal,
            owner: OwnerId::new(),
            gate: tokio::sync::Mutex::new(()),
            holding: Mutex::new(None),
            listeners: Subscribers::new(),
        }
    }

    fn holding(&self) -> MutexGuard<'_, Option<Holding>> {
        self.holding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This coordinator's owner tag.
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The signal shared with the evolution loop.
    pub fn signal(&self) -> LockSignal {
        self.signal.clone()
    }

    /// Whether this coordinator currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.holding().is_some()
    }

    /// Take the lock for a manual session.
    ///
    /// Idempotent: while held, returns the existing session's token. The
    /// token is cancelled on release.
    ///
    /// Cancel-safe: the hold is recorded before the first await, so if this
    /// future is dropped midway a later [`release`](Self::release) still
    /// resumes the loop and clears the record.
    pub async fn acquire(&self) -> CancelToken {
        let _gate = self.gate.lock().await;
        let existing = self.holding().as_ref().map(|h| h.token.clone());
        if let Some(token) = existing {
            debug!(owner = %self.owner, "lock already held, reusing session");
            return token;
        }

        let token = CancelToken::new();
        let was_running = self.control.is_running();
        let was_paused = self.control.is_paused();
        let paused_by_us = was_running && !was_paused;
        *self.holding() = Some(Holding {
            token: token.clone(),
            was_running,
            was_paused,
            paused_by_us,
            acquired_at: Instant::now(),
        });
        self.signal.set_local(true);
        self.listeners.publish(&true);
        if paused_by_us {
            self.control.request_pause();
        }

        self.persist(true).await;
        if paused_by_us {
            tokio::time::sleep(Duration::from_millis(self.policy.pause_settle_ms)).await;
        }
        info!(
            owner = %self.owner,
            was_running,
            was_paused,
            paused_by_us,
            "manual session acquired engine lock"
        );
        token
    }

    /// End the manual session. Returns `false` if the lock was not held.
    pub async fn release(&self) -> bool {
        let _gate = self.gate.lock().await;
        let taken = self.holding().take();
        let Some(holding) = taken else {
            debug!(owner = %self.owner, "release without hold ignored");
            return false;
        };

        holding.token.cancel();
        self.signal.set_local(false);
        self.listeners.publish(&false);
        self.persist(false).await;
        tokio::time::sleep(Duration::from_millis(self.policy.release_settle_ms)).await;

        if holding.paused_by_us {
            self.control.request_resume();
        }
        info!(
            owner = %self.owner,
            held_for_ms = millis(holding.acquired_at.elapsed()),
            resumed = holding.paused_by_us,
            "manual session released engine lock"
        );
        true
    }

    /// Hold the lock for the duration of `session`, then release it.
    ///
    /// If the lock is already held, `session` joins that hold and the
    /// release at the end ends it for everyone.
    pub async fn with_lock<F, Fut, T>(&self, session: F) -> T
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self.acquire().await;
        let output = session(token).await;
        self.release().await;
        output
    }

    /// Call `listener` with the new held state on every transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Diagnostic snapshot.
    pub fn state(&self) -> LockSnapshot {
        let holding = self.holding();
        LockSnapshot {
            held: holding.is_some(),
            was_running: holding.as_ref().is_some_and(|h| h.was_running),
            was_paused: holding.as_ref().is_some_and(|h| h.was_paused),
            held_for_ms: holding.as_ref().map(|h| millis(h.acquired_at.elapsed())),
            remote_held: self.signal.is_remote(),
            owner: self.owner,
        }
    }

    /// Read the persisted record and update the remote bit.
    ///
    /// Records written by this coordinator, unlocked records, and records
    /// past their expiry never count as a remote hold. A failed read
    /// leaves the bit unchanged.
    pub async fn poll_remote(&self) -> bool {
        let read = tokio::time::timeout(
            Duration::from_millis(self.policy.persist_timeout_ms),
            self.store.get_by_key(&self.policy.lock_key),
        )
        .await;

        let value = match read {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(key = %self.policy.lock_key, error = %e, "lock record read failed");
                return self.signal.is_remote();
            }
            Err(_elapsed) => {
                warn!(key = %self.policy.lock_key, "lock record read timed out");
                return self.signal.is_remote();
            }
        };

        let record = value.and_then(|v| match serde_json::from_value::<LockRecord>(v) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %self.policy.lock_key, error = %e, "unreadable lock record ignored");
                None
            }
        });
        let remote = record
            .as_ref()
            .is_some_and(|r| r.owner != self.owner && r.is_active_at(Utc::now()));

        let previous = self.signal.set_remote(remote);
        if previous != remote {
            info!(
                remote_held = remote,
                remote_owner = ?record.map(|r| r.owner),
                "remote engine lock changed"
            );
        }
        remote
    }

    /// Overwrite a stale persisted hold with an unlocked record.
    ///
    /// Refused while this coordinator holds the lock itself.
    pub async fn clear_remote_record(&self) -> bool {
        let _gate = self.gate.lock().await;
        if self.holding().is_some() {
            warn!(owner = %self.owner, "refusing to clear lock record while holding it");
            return false;
        }
        self.persist(false).await;
        self.signal.set_remote(false);
        info!(key = %self.policy.lock_key, "persisted engine lock cleared by operator");
        true
    }

    async fn persist(&self, locked: bool) {
        let record = lock_record(&self.policy, self.owner, locked, Utc::now());
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "lock record could not be encoded");
                return;
            }
        };

        let write = tokio::time::timeout(
            Duration::from_millis(self.policy.persist_timeout_ms),
            self.store.upsert_by_key(&self.policy.lock_key, value),
        )
        .await;
        match write {
            Ok(Ok(())) => debug!(key = %self.policy.lock_key, locked, "lock record written"),
            Ok(Err(e)) => {
                warn!(key = %self.policy.lock_key, locked, error = %e, "lock record write failed");
            }
            Err(_elapsed) => {
                warn!(key = %self.policy.lock_key, locked, "lock record write timed out");
            }
        }
    }

    /// Spawn the task that keeps the remote bit in sync with storage.
    ///
    /// The task ends once the coordinator is dropped.
    pub fn spawn_remote_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = Duration::from_millis(self.policy.remote_poll_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                coordinator.poll_remote().await;
            }
        })
    }
}

fn lock_record(policy: &LockPolicy, owner: OwnerId, locked: bool, now: DateTime<Utc>) -> LockRecord {
    let expires_at = if locked && policy.lock_ttl_secs > 0 {
        i64::try_from(policy.lock_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
    } else {
        None
    };
    LockRecord {
        key: policy.lock_key.clone(),
        locked,
        owner,
        timestamp: now,
        expires_at,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Default)]
    struct MockLoop {
        running: AtomicBool,
        paused: AtomicBool,
        pauses: AtomicU32,
        resumes: AtomicU32,
    }

    impl MockLoop {
        fn with(running: bool, paused: bool) -> Arc<Self> {
            let mock = Self::default();
            mock.running.store(running, Ordering::SeqCst);
            mock.paused.store(paused, Ordering::SeqCst);
            Arc::new(mock)
        }

        fn condition(&self) -> (bool, bool) {
            (self.is_running(), self.is_paused())
        }
    }

    impl LoopControl for MockLoop {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }

        fn request_pause(&self) {
            if self.is_running() && !self.is_paused() {
                self.paused.store(true, Ordering::SeqCst);
                self.pauses.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn request_resume(&self) {
            if self.is_running() && self.is_paused() {
                self.paused.store(false, Ordering::SeqCst);
                self.resumes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn coordinator(
        control: &Arc<MockLoop>,
        store: &Arc<MemoryStore>,
    ) -> LockCoordinator<MockLoop, MemoryStore> {
        LockCoordinator::new(
            Arc::clone(control),
            Arc::clone(store),
            LockSignal::new(),
            LockPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_is_idempotent() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        let first = coord.acquire().await;
        let second = coord.acquire().await;
        assert_eq!(control.pauses.load(Ordering::SeqCst), 1);

        assert!(coord.release().await);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!coord.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn release_restores_every_pre_acquire_condition() {
        for (running, paused) in [(true, false), (true, true), (false, false), (false, true)] {
            let control = MockLoop::with(running, paused);
            let store = Arc::new(MemoryStore::new());
            let coord = coordinator(&control, &store);

            coord.acquire().await;
            let snapshot = coord.state();
            assert!(snapshot.held);
            assert_eq!(snapshot.was_running, running);
            assert_eq!(snapshot.was_paused, paused);
            if running && !paused {
                assert_eq!(control.condition(), (true, true));
            }

            coord.release().await;
            assert_eq!(control.condition(), (running, paused), "case ({running}, {paused})");
            let expected_resumes = u32::from(running && !paused);
            assert_eq!(control.resumes.load(Ordering::SeqCst), expected_resumes);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn held_intervals_never_overlap() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(coordinator(&control, &store));

        let transitions = Arc::new(Mutex::new(Vec::new()));
        coord
            .subscribe({
                let transitions = Arc::clone(&transitions);
                move |held| transitions.lock().unwrap().push(*held)
            })
            .detach();

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        coord.acquire().await;
                    } else {
                        coord.release().await;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    coord.acquire().await;
                    coord.release().await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let transitions = transitions.lock().unwrap();
        assert!(!transitions.is_empty());
        for (index, held) in transitions.iter().enumerate() {
            assert_eq!(*held, index % 2 == 0, "transition {index} out of order: {transitions:?}");
        }
        assert!(!coord.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_record_tracks_hold() {
        let control = MockLoop::with(false, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        coord.acquire().await;
        let value = store.get_by_key("analysis_engine").await.unwrap().unwrap();
        let record: LockRecord = serde_json::from_value(value).unwrap();
        assert!(record.locked);
        assert_eq!(record.owner, coord.owner());
        assert!(record.expires_at.is_some());

        coord.release().await;
        let value = store.get_by_key("analysis_engine").await.unwrap().unwrap();
        let record: LockRecord = serde_json::from_value(value).unwrap();
        assert!(!record.locked);
        assert!(record.expires_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_acquire_can_still_be_released() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(coordinator(&control, &store));

        let pending = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move {
                coord.acquire().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(coord.is_held());
        assert_eq!(control.condition(), (true, true));

        assert!(coord.release().await);
        assert_eq!(control.condition(), (true, false));
        assert!(!coord.signal().is_local());
        let value = store.get_by_key("analysis_engine").await.unwrap().unwrap();
        let record: LockRecord = serde_json::from_value(value).unwrap();
        assert!(!record.locked);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_does_not_abort_coordination() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let coord = coordinator(&control, &store);

        coord.acquire().await;
        assert!(coord.is_held());
        assert!(coord.signal().is_local());
        assert_eq!(control.condition(), (true, true));

        assert!(coord.release().await);
        assert!(!coord.signal().is_local());
        assert_eq!(control.condition(), (true, false));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_listener_does_not_block_notification() {
        let control = MockLoop::with(false, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _bad = coord.subscribe(|_| panic!("listener failure"));
        let _good = coord.subscribe({
            let seen = Arc::clone(&seen);
            move |held| seen.lock().unwrap().push(*held)
        });

        coord.acquire().await;
        coord.release().await;
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_releases_after_session() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        let result = coord
            .with_lock(|token| async move {
                assert!(!token.is_cancelled());
                42
            })
            .await;
        assert_eq!(result, 42);
        assert!(!coord.is_held());
        assert_eq!(control.condition(), (true, false));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_hold_from_another_owner_is_observed() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        let other = lock_record(&LockPolicy::default(), OwnerId::new(), true, Utc::now());
        store
            .upsert_by_key("analysis_engine", serde_json::to_value(&other).unwrap())
            .await
            .unwrap();
        assert!(coord.poll_remote().await);
        assert!(coord.signal().is_held());
        assert!(coord.state().remote_held);

        assert!(coord.clear_remote_record().await);
        assert!(!coord.poll_remote().await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_or_own_record_is_not_remote() {
        let control = MockLoop::with(true, false);
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&control, &store);

        let stale = lock_record(
            &LockPolicy::default(),
            OwnerId::new(),
            true,
            Utc::now() - TimeDelta::hours(1),
        );
        store
            .upsert_by_key("analysis_engine", serde_json::to_value(&stale).unwrap())
            .await
            .unwrap();
        assert!(!coord.poll_remote().await);

        coord.acquire().await;
        assert!(!coord.poll_remote().await);
        assert!(!coord.clear_remote_record().await);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_watch_stops_with_coordinator() {
        let control = MockLoop::with(false, false);
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(coordinator(&control, &store));

        let handle = coord.spawn_remote_watch();
        tokio::time::sleep(Duration::from_millis(12_000)).await;
        drop(coord);
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert!(handle.is_finished());
    }
}

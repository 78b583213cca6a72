//! The autonomous evolution loop.
//!
//! A small state machine (`Stopped`, `Running`, `Paused`) driving one
//! periodic trigger per [`Pool`]. Every tick that finds the loop running
//! and no manual holder on the [`LockSignal`] runs one batch:
//!
//! 1. seed the dedup ledger (first batch only)
//! 2. fetch candidate games through the rate limiter and retry policy
//! 3. drop games the ledger already knows
//! 4. hand the rest to the engine under a deadline
//! 5. mark the analyzed games known and record them in storage
//!
//! Between those steps the batch checks its safe point: if the loop was
//! paused or stopped, or a manual session took the lock, the batch yields
//! without touching the counters. While the engine is busy the check is
//! polled every `safe_point_poll_ms` and a yield cancels the work unit.
//!
//! Batches never overlap; the two triggers queue on one gate. Failures
//! are counted, and once `failure_threshold` consecutive batches fail the
//! loop resets the engine adapter and carries on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vigil_resilience::{RetryError, RetryPolicy, SlidingWindowLimiter, with_retry};
use vigil_types::{BatchId, EvolutionEvent, EvolutionPhase, EvolutionState, GameRecord, Pool};

use crate::cancel::CancelToken;
use crate::coordinator::{LockSignal, LoopControl};
use crate::engine::{AnalysisEngine, AnalysisOutcome, EngineError, GameFeed, WorkUnit};
use crate::ledger::{DedupLedger, to_raw_id};
use crate::pubsub::{Subscribers, Subscription};
use crate::store::RecordStore;

/// Tuning for the evolution loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EvolutionPolicy {
    /// Tick period of the cloud pool.
    #[serde(default = "default_cloud_interval_ms")]
    pub cloud_interval_ms: u64,

    /// Tick period of the local pool.
    #[serde(default = "default_local_interval_ms")]
    pub local_interval_ms: u64,

    /// Games requested from the feed per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Budget for one engine call.
    #[serde(default = "default_engine_deadline_ms")]
    pub engine_deadline_ms: u64,

    /// Consecutive failed batches that trigger recovery.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Poll period of the safe-point check while the engine is busy.
    #[serde(default = "default_safe_point_poll_ms")]
    pub safe_point_poll_ms: u64,

    /// Table receiving one telemetry row per event.
    #[serde(default = "default_events_table")]
    pub events_table: String,

    /// Start the loop as soon as the service is up.
    #[serde(default)]
    pub autostart: bool,
}

impl Default for EvolutionPolicy {
    fn default() -> Self {
        Self {
            cloud_interval_ms: default_cloud_interval_ms(),
            local_interval_ms: default_local_interval_ms(),
            batch_size: default_batch_size(),
            engine_deadline_ms: default_engine_deadline_ms(),
            failure_threshold: default_failure_threshold(),
            safe_point_poll_ms: default_safe_point_poll_ms(),
            events_table: default_events_table(),
            autostart: false,
        }
    }
}

impl EvolutionPolicy {
    /// Tick period for `pool`, never zero.
    pub fn interval(&self, pool: Pool) -> Duration {
        let ms = match pool {
            Pool::Cloud => self.cloud_interval_ms,
            Pool::Local => self.local_interval_ms,
        };
        Duration::from_millis(ms.max(1))
    }
}

const fn default_cloud_interval_ms() -> u64 {
    30_000
}

const fn default_local_interval_ms() -> u64 {
    10_000
}

const fn default_batch_size() -> usize {
    20
}

const fn default_engine_deadline_ms() -> u64 {
    60_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_safe_point_poll_ms() -> u64 {
    250
}

fn default_events_table() -> String {
    "evolution_events".to_owned()
}

/// Errors from evolution operations and failed batches.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    /// A batch was forced while the loop was not running.
    #[error("evolution loop is {0:?}, not running")]
    NotRunning(EvolutionPhase),

    /// The feed could not deliver candidates.
    #[error("feed fetch failed: {0}")]
    Feed(#[source] RetryError<EngineError>),

    /// The engine call failed.
    #[error("analysis failed: {0}")]
    Analysis(#[source] RetryError<EngineError>),

    /// The engine answered but reported failure.
    #[error("engine reported an unsuccessful analysis")]
    Unsuccessful,
}

/// What one batch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The batch finished; `delta` games were analyzed.
    Completed {
        /// Batch identifier.
        batch_id: BatchId,
        /// Games analyzed.
        delta: u64,
    },
    /// The batch stopped at a safe point without changing any counter.
    Yielded,
    /// The batch failed and was counted toward recovery.
    Failed {
        /// Rendered error.
        reason: String,
    },
}

/// Shared collaborators of the loop.
pub struct Collaborators<E, F, S> {
    /// The analysis engine.
    pub engine: Arc<E>,
    /// The candidate game feed.
    pub feed: Arc<F>,
    /// Sink for telemetry and analyzed-game rows.
    pub store: Arc<S>,
    /// Known-game ledger.
    pub ledger: Arc<DedupLedger<S>>,
    /// Limiter guarding feed and engine calls.
    pub limiter: Arc<SlidingWindowLimiter>,
}

/// The autonomous batch loop.
pub struct EvolutionLoop<E, F, S> {
    engine: Arc<E>,
    feed: Arc<F>,
    store: Arc<S>,
    ledger: Arc<DedupLedger<S>>,
    limiter: Arc<SlidingWindowLimiter>,
    policy: EvolutionPolicy,
    retry: RetryPolicy,
    signal: LockSignal,
    state: Mutex<EvolutionState>,
    session: Mutex<CancelToken>,
    triggers: Mutex<Vec<JoinHandle<()>>>,
    batch_gate: tokio::sync::Mutex<()>,
    listeners: Subscribers<EvolutionEvent>,
}

impl<E, F, S> std::fmt::Debug for EvolutionLoop<E, F, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionLoop")
            .field("policy", &self.policy)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_all_status(state: &mut EvolutionState, status: &str) {
    for pool in Pool::ALL {
        state.pool_status.insert(pool, status.to_owned());
    }
}

impl<E: AnalysisEngine, F: GameFeed, S: RecordStore> EvolutionLoop<E, F, S> {
    /// Build a stopped loop.
    pub fn new(
        collaborators: Collaborators<E, F, S>,
        policy: EvolutionPolicy,
        retry: RetryPolicy,
        signal: LockSignal,
    ) -> Self {
        let mut state = EvolutionState::default();
        set_all_status(&mut state, "stopped");
        Self {
            engine: collaborators.engine,
            feed: collaborators.feed,
            store: collaborators.store,
            ledger: collaborators.ledger,
            limiter: collaborators.limiter,
            policy,
            retry,
            signal,
            state: Mutex::new(state),
            session: Mutex::new(CancelToken::new()),
            triggers: Mutex::new(Vec::new()),
            batch_gate: tokio::sync::Mutex::new(()),
            listeners: Subscribers::new(),
        }
    }

    /// The active policy.
    pub const fn policy(&self) -> &EvolutionPolicy {
        &self.policy
    }

    /// The ledger consulted by every batch.
    pub const fn ledger(&self) -> &Arc<DedupLedger<S>> {
        &self.ledger
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> EvolutionState {
        lock(&self.state).clone()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> EvolutionPhase {
        lock(&self.state).phase()
    }

    /// Receive every event at emit time.
    pub fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn(&EvolutionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Move to `Running`.
    ///
    /// From `Stopped` this opens a new session and spawns the pool
    /// triggers. From `Paused` it behaves like [`resume`](Self::resume).
    /// Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let started_at = {
            let mut state = lock(&self.state);
            match state.phase() {
                EvolutionPhase::Running => return false,
                EvolutionPhase::Paused => {
                    state.is_paused = false;
                    set_all_status(&mut state, "idle");
                    None
                }
                EvolutionPhase::Stopped => {
                    let now = Utc::now();
                    state.is_running = true;
                    state.is_paused = false;
                    state.session_count = 0;
                    state.session_started_at = Some(now);
                    set_all_status(&mut state, "idle");
                    *lock(&self.session) = CancelToken::new();
                    Some(now)
                }
            }
        };

        let Some(session_started_at) = started_at else {
            info!("evolution loop resumed by start");
            return true;
        };

        let handles: Vec<JoinHandle<()>> =
            Pool::ALL.iter().map(|&pool| self.spawn_trigger(pool)).collect();
        for stale in std::mem::replace(&mut *lock(&self.triggers), handles) {
            stale.abort();
        }
        info!(
            cloud_interval_ms = self.policy.cloud_interval_ms,
            local_interval_ms = self.policy.local_interval_ms,
            "evolution loop started"
        );
        self.emit(EvolutionEvent::EngineStarted { session_started_at });
        true
    }

    /// Move to `Stopped` from any phase, cancelling all scheduled work.
    pub fn stop(&self) -> bool {
        let session_count = {
            let mut state = lock(&self.state);
            if !state.is_running {
                return false;
            }
            state.is_running = false;
            state.is_paused = false;
            set_all_status(&mut state, "stopped");
            lock(&self.session).cancel();
            state.session_count
        };
        for trigger in lock(&self.triggers).drain(..) {
            trigger.abort();
        }
        info!(session_count, "evolution loop stopped");
        self.emit(EvolutionEvent::EngineStopped { session_count });
        true
    }

    /// Move `Running` to `Paused`. Triggers keep ticking as no-ops.
    pub fn pause(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.phase() != EvolutionPhase::Running {
                return false;
            }
            state.is_paused = true;
            set_all_status(&mut state, "paused");
        }
        info!("evolution loop paused");
        true
    }

    /// Move `Paused` to `Running`.
    pub fn resume(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.phase() != EvolutionPhase::Paused {
                return false;
            }
            state.is_paused = false;
            set_all_status(&mut state, "idle");
        }
        info!("evolution loop resumed");
        true
    }

    /// Run one batch for `pool` now, outside the schedule.
    pub async fn force_run_batch(&self, pool: Pool) -> Result<BatchOutcome, EvolutionError> {
        let phase = self.phase();
        if phase != EvolutionPhase::Running {
            return Err(EvolutionError::NotRunning(phase));
        }
        info!(%pool, "forced batch requested");
        Ok(self.run_batch(pool).await)
    }

    fn session_token(&self) -> CancelToken {
        lock(&self.session).clone()
    }

    fn should_yield(&self, token: &CancelToken) -> bool {
        token.is_cancelled() || self.signal.is_held() || self.phase() != EvolutionPhase::Running
    }

    async fn wait_for_yield(&self, token: &CancelToken) {
        let poll = Duration::from_millis(self.policy.safe_point_poll_ms.max(1));
        loop {
            if self.should_yield(token) {
                return;
            }
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn set_pool_status(&self, pool: Pool, status: impl Into<String>) {
        lock(&self.state).pool_status.insert(pool, status.into());
    }

    async fn run_batch(&self, pool: Pool) -> BatchOutcome {
        let _gate = self.batch_gate.lock().await;
        let token = self.session_token();
        if self.should_yield(&token) {
            debug!(%pool, "batch skipped at entry");
            return BatchOutcome::Yielded;
        }

        let batch_id = BatchId::new();
        match self.execute(pool, batch_id, &token).await {
            Ok(Some(delta)) => {
                self.record_success(pool, batch_id, delta);
                BatchOutcome::Completed { batch_id, delta }
            }
            Ok(None) => {
                self.set_pool_status(pool, "yielded");
                info!(%pool, %batch_id, "batch yielded at safe point");
                BatchOutcome::Yielded
            }
            Err(error) => {
                let reason = error.to_string();
                self.record_failure(pool, &error);
                BatchOutcome::Failed { reason }
            }
        }
    }

    async fn execute(
        &self,
        pool: Pool,
        batch_id: BatchId,
        token: &CancelToken,
    ) -> Result<Option<u64>, EvolutionError> {
        self.ledger.init_known_ids().await;
        if self.should_yield(token) {
            return Ok(None);
        }

        self.set_pool_status(pool, "fetching");
        let games = self.fetch(pool).await.map_err(EvolutionError::Feed)?;
        let fetched = games.len();
        let fresh = self.ledger.filter_fresh_games(games);
        if fresh.is_empty() {
            debug!(%pool, %batch_id, fetched, "no fresh games");
            return Ok(Some(0));
        }
        if self.should_yield(token) {
            return Ok(None);
        }

        let unit = WorkUnit {
            batch_id,
            pool,
            games: fresh,
            cancel: CancelToken::new(),
        };
        self.set_pool_status(pool, format!("analyzing {} games", unit.games.len()));
        let outcome = tokio::select! {
            biased;
            () = self.wait_for_yield(token) => {
                unit.cancel.cancel();
                return Ok(None);
            }
            result = self.analyze(&unit) => result.map_err(EvolutionError::Analysis)?,
        };
        if !outcome.success {
            return Err(EvolutionError::Unsuccessful);
        }
        if self.should_yield(token) {
            return Ok(None);
        }

        for game in &unit.games {
            if let Some(id) = game.identifier()
                && self.ledger.mark_known(id)
            {
                self.record_analyzed(id, game.provider.as_deref());
            }
        }
        Ok(Some(outcome.items))
    }

    /// Write an analyzed game to the table the ledger seeds from.
    fn record_analyzed(&self, id: &str, provider: Option<&str>) {
        let policy = self.ledger.policy();
        let raw = to_raw_id(id, &policy.id_prefixes);
        let provider = provider
            .filter(|p| !p.is_empty())
            .or_else(|| {
                id.strip_suffix(raw)
                    .map(|prefix| prefix.trim_end_matches('_'))
                    .filter(|p| !p.is_empty())
            });
        let mut row = serde_json::Map::new();
        row.insert(policy.id_field.clone(), json!(raw));
        row.insert("provider".to_owned(), json!(provider));
        self.store
            .insert_fire_and_forget(&policy.table, serde_json::Value::Object(row));
    }

    async fn fetch(&self, pool: Pool) -> Result<Vec<GameRecord>, RetryError<EngineError>> {
        let feed = &self.feed;
        let limiter = &self.limiter;
        let limit = self.policy.batch_size;
        let key = format!("feed:{pool}");
        let key = key.as_str();
        with_retry(&self.retry, move || async move {
            limiter.acquire(key)?;
            feed.fetch(pool, limit).await
        })
        .await
    }

    async fn analyze(&self, unit: &WorkUnit) -> Result<AnalysisOutcome, RetryError<EngineError>> {
        let engine = &self.engine;
        let limiter = &self.limiter;
        let deadline_ms = self.policy.engine_deadline_ms;
        let deadline = Duration::from_millis(deadline_ms);
        let key = format!("engine:{}", unit.pool);
        let key = key.as_str();
        debug!(engine = engine.name(), batch_id = %unit.batch_id, games = unit.games.len(), "engine call");
        with_retry(&self.retry, move || async move {
            limiter.acquire(key)?;
            match tokio::time::timeout(deadline, engine.analyze(unit, deadline)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(EngineError::Deadline(deadline_ms)),
            }
        })
        .await
    }

    fn record_success(&self, pool: Pool, batch_id: BatchId, delta: u64) {
        {
            let mut state = lock(&self.state);
            state.consecutive_errors = 0;
            state.session_count = state.session_count.saturating_add(delta);
            state.total_count = state.total_count.saturating_add(delta);
            let count = state.pool_counts.entry(pool).or_insert(0);
            *count = count.saturating_add(delta);
            state.last_success_at = Some(Utc::now());
            state
                .pool_status
                .insert(pool, format!("idle, last batch analyzed {delta}"));
        }
        info!(%pool, %batch_id, delta, "batch complete");
        self.emit(EvolutionEvent::BatchComplete {
            batch_id,
            pool,
            delta,
        });
    }

    fn record_failure(&self, pool: Pool, error: &EvolutionError) {
        let threshold = self.policy.failure_threshold.max(1);
        let (errors, recovered) = {
            let mut state = lock(&self.state);
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            state.last_error_at = Some(Utc::now());
            state.pool_status.insert(pool, format!("error: {error}"));
            let errors = state.consecutive_errors;
            let recovered = errors >= threshold;
            if recovered {
                state.recovery_count = state.recovery_count.saturating_add(1);
                state.consecutive_errors = 0;
            }
            (errors, recovered)
        };
        warn!(%pool, consecutive_errors = errors, error = %error, "batch failed");

        if recovered {
            self.engine.reset();
            info!(
                engine = self.engine.name(),
                after_errors = errors,
                "recovery complete, engine adapter reset"
            );
            self.emit(EvolutionEvent::RecoveryComplete {
                after_errors: errors,
            });
        }
    }

    fn emit(&self, event: EvolutionEvent) {
        self.listeners.publish(&event);
        if matches!(event, EvolutionEvent::BatchComplete { delta: 0, .. }) {
            return;
        }
        match serde_json::to_value(&event) {
            Ok(payload) => self.store.insert_fire_and_forget(
                &self.policy.events_table,
                json!({
                    "event": event.name(),
                    "payload": payload,
                    "recorded_at": Utc::now(),
                }),
            ),
            Err(e) => warn!(event = event.name(), error = %e, "event could not be encoded"),
        }
    }

    async fn on_tick(&self, pool: Pool) {
        if self.phase() != EvolutionPhase::Running {
            debug!(%pool, "tick skipped, loop not running");
            return;
        }
        if self.signal.is_held() {
            debug!(%pool, "tick skipped, manual session holds the engine");
            return;
        }
        let outcome = self.run_batch(pool).await;
        debug!(%pool, ?outcome, "scheduled batch finished");
    }

    fn spawn_trigger(self: &Arc<Self>, pool: Pool) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.policy.interval(pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; batches start one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(evolution) = weak.upgrade() else {
                    return;
                };
                evolution.on_tick(pool).await;
            }
        })
    }
}

impl<E: AnalysisEngine, F: GameFeed, S: RecordStore> LoopControl for EvolutionLoop<E, F, S> {
    fn is_running(&self) -> bool {
        lock(&self.state).is_running
    }

    fn is_paused(&self) -> bool {
        lock(&self.state).is_paused
    }

    fn request_pause(&self) {
        self.pause();
    }

    fn request_resume(&self) {
        self.resume();
    }
}

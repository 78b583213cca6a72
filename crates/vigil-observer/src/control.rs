//! Type-erased access to the coordination core.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use vigil_core::coordinator::LockCoordinator;
use vigil_core::engine::{AnalysisEngine, GameFeed};
use vigil_core::evolution::{BatchOutcome, EvolutionError, EvolutionLoop};
use vigil_core::pubsub::Subscription;
use vigil_core::store::RecordStore;
use vigil_types::{EvolutionState, LockSnapshot, Pool};

use crate::state::StreamMessage;

/// Size and readiness of the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    /// Ids currently known.
    pub known_ids: usize,
    /// Whether the initial load has finished.
    pub initialized: bool,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Manual-session lock.
    pub lock: LockSnapshot,
    /// Evolution loop counters and phase.
    pub evolution: EvolutionState,
    /// Dedup ledger.
    pub ledger: LedgerStatus,
}

/// Operations the operator API can invoke.
pub trait ControlPlane: Send + Sync + 'static {
    /// Current status of every component.
    fn status(&self) -> StatusReport;
    /// Open a manual session, waiting for the loop to settle.
    ///
    /// The session belongs to an operator outside this process, so no
    /// cancellation token is handed out. It lasts until
    /// [`release_lock`](Self::release_lock), which also cancels the token
    /// any in-process holder got from the coordinator.
    fn acquire_lock(&self) -> BoxFuture<'_, LockSnapshot>;
    /// End the manual session. `false` if none was open.
    fn release_lock(&self) -> BoxFuture<'_, bool>;
    /// Overwrite a lock record left behind by another process.
    fn clear_remote_lock(&self) -> BoxFuture<'_, bool>;
    /// Start (or resume) the evolution loop.
    fn start(&self) -> bool;
    /// Stop the evolution loop.
    fn stop(&self) -> bool;
    /// Pause the evolution loop.
    fn pause(&self) -> bool;
    /// Resume a paused evolution loop.
    fn resume(&self) -> bool;
    /// Run one batch for `pool` immediately.
    fn force_batch(&self, pool: Pool) -> BoxFuture<'_, Result<BatchOutcome, EvolutionError>>;
}

type Coordinator<E, F, S> = LockCoordinator<EvolutionLoop<E, F, S>, S>;

/// [`ControlPlane`] over a live loop and its coordinator.
pub struct Runtime<E, F, S> {
    evolution: Arc<EvolutionLoop<E, F, S>>,
    coordinator: Arc<Coordinator<E, F, S>>,
}

impl<E, F, S> std::fmt::Debug for Runtime<E, F, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("evolution", &self.evolution)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl<E: AnalysisEngine, F: GameFeed, S: RecordStore> Runtime<E, F, S> {
    /// Bundle a loop with the coordinator that drives it.
    pub const fn new(
        evolution: Arc<EvolutionLoop<E, F, S>>,
        coordinator: Arc<Coordinator<E, F, S>>,
    ) -> Self {
        Self {
            evolution,
            coordinator,
        }
    }

    /// Forward evolution events and lock transitions into `tx`.
    ///
    /// Forwarding stops when the returned handles are dropped.
    pub fn forward_to(&self, tx: &broadcast::Sender<StreamMessage>) -> [Subscription; 2] {
        let events = tx.clone();
        let evolution = self.evolution.subscribe(move |event| {
            // Zero receivers is normal when no client is connected.
            events
                .send(StreamMessage::Evolution {
                    event: event.clone(),
                })
                .unwrap_or(0);
        });
        let transitions = tx.clone();
        let lock = self.coordinator.subscribe(move |held| {
            transitions
                .send(StreamMessage::Lock { held: *held })
                .unwrap_or(0);
        });
        [evolution, lock]
    }
}

impl<E: AnalysisEngine, F: GameFeed, S: RecordStore> ControlPlane for Runtime<E, F, S> {
    fn status(&self) -> StatusReport {
        let ledger = self.evolution.ledger();
        StatusReport {
            lock: self.coordinator.state(),
            evolution: self.evolution.state(),
            ledger: LedgerStatus {
                known_ids: ledger.known_count(),
                initialized: ledger.is_initialized(),
            },
        }
    }

    fn acquire_lock(&self) -> BoxFuture<'_, LockSnapshot> {
        async move {
            // Dropping the token does not end the session; release_lock does.
            self.coordinator.acquire().await;
            self.coordinator.state()
        }
        .boxed()
    }

    fn release_lock(&self) -> BoxFuture<'_, bool> {
        self.coordinator.release().boxed()
    }

    fn clear_remote_lock(&self) -> BoxFuture<'_, bool> {
        self.coordinator.clear_remote_record().boxed()
    }

    fn start(&self) -> bool {
        self.evolution.start()
    }

    fn stop(&self) -> bool {
        self.evolution.stop()
    }

    fn pause(&self) -> bool {
        self.evolution.pause()
    }

    fn resume(&self) -> bool {
        self.evolution.resume()
    }

    fn force_batch(&self, pool: Pool) -> BoxFuture<'_, Result<BatchOutcome, EvolutionError>> {
        self.evolution.force_run_batch(pool).boxed()
    }
}

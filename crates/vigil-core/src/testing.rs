//! Scriptable engine and feed fakes shared by the unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use vigil_types::{GameRecord, Pool};

use crate::cancel::CancelToken;
use crate::engine::{AnalysisEngine, AnalysisOutcome, EngineError, GameFeed, WorkUnit};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    calls: AtomicU32,
    resets: AtomicU32,
    fail_with: Mutex<Option<EngineError>>,
    delay: Mutex<Option<Duration>>,
    last_cancel: Mutex<Option<CancelToken>>,
}

impl FakeEngine {
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_with(&self, error: Option<EngineError>) {
        *lock(&self.fail_with) = error;
    }

    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub(crate) fn last_cancel(&self) -> Option<CancelToken> {
        lock(&self.last_cancel).clone()
    }
}

impl AnalysisEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn analyze(
        &self,
        unit: &WorkUnit,
        _deadline: Duration,
    ) -> Result<AnalysisOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_cancel) = Some(unit.cancel.clone());
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = lock(&self.fail_with).clone();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(AnalysisOutcome {
            success: true,
            items: u64::try_from(unit.games.len()).unwrap_or(u64::MAX),
        })
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeFeed {
    games: Mutex<Vec<GameRecord>>,
    calls: AtomicU32,
}

impl FakeFeed {
    pub(crate) fn with_games(ids: &[&str]) -> Self {
        Self {
            games: Mutex::new(ids.iter().map(|id| GameRecord::with_id(*id)).collect()),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GameFeed for FakeFeed {
    async fn fetch(&self, _pool: Pool, limit: usize) -> Result<Vec<GameRecord>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.games).iter().take(limit).cloned().collect())
    }
}

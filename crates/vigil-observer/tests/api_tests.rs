//! Integration tests for the operator API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` against a
//! real evolution loop and coordinator backed by the in-memory store.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use vigil_core::coordinator::{LockCoordinator, LockPolicy, LockSignal};
use vigil_core::engine::{AnalysisEngine, AnalysisOutcome, EngineError, GameFeed, WorkUnit};
use vigil_core::evolution::{Collaborators, EvolutionLoop, EvolutionPolicy};
use vigil_core::ledger::{DedupLedger, DedupPolicy};
use vigil_core::pubsub::Subscription;
use vigil_core::store::MemoryStore;
use vigil_observer::router::build_router;
use vigil_observer::state::{AppState, StreamMessage};
use vigil_observer::{ControlPlane, Runtime};
use vigil_resilience::{RateLimitPolicy, RetryPolicy, SlidingWindowLimiter};
use vigil_types::{EvolutionEvent, GameRecord, Pool};

#[derive(Debug)]
struct CountingEngine;

impl AnalysisEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    async fn analyze(
        &self,
        unit: &WorkUnit,
        _deadline: Duration,
    ) -> Result<AnalysisOutcome, EngineError> {
        Ok(AnalysisOutcome {
            success: true,
            items: u64::try_from(unit.games.len()).unwrap(),
        })
    }

    fn reset(&self) {}
}

#[derive(Debug)]
struct StaticFeed(Vec<GameRecord>);

impl GameFeed for StaticFeed {
    async fn fetch(&self, _pool: Pool, limit: usize) -> Result<Vec<GameRecord>, EngineError> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

struct Harness {
    state: Arc<AppState>,
    _forwarding: [Subscription; 2],
}

fn make_harness() -> Harness {
    make_harness_with_settle(0)
}

fn make_harness_with_settle(settle_ms: u64) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(DedupLedger::new(Arc::clone(&store), DedupPolicy::default()));
    let signal = LockSignal::new();
    let evolution = Arc::new(EvolutionLoop::new(
        Collaborators {
            engine: Arc::new(CountingEngine),
            feed: Arc::new(StaticFeed(vec![
                GameRecord::with_id("lichess_a"),
                GameRecord::with_id("lichess_b"),
                GameRecord::with_id("chesscom_c"),
            ])),
            store: Arc::clone(&store),
            ledger,
            limiter: Arc::new(SlidingWindowLimiter::new(RateLimitPolicy::default())),
        },
        EvolutionPolicy::default(),
        RetryPolicy::default(),
        signal.clone(),
    ));
    let coordinator = Arc::new(LockCoordinator::new(
        Arc::clone(&evolution),
        store,
        signal,
        LockPolicy {
            pause_settle_ms: settle_ms,
            release_settle_ms: settle_ms,
            ..LockPolicy::default()
        },
    ));

    let runtime = Arc::new(Runtime::new(evolution, coordinator));
    let control: Arc<dyn ControlPlane> = Arc::clone(&runtime) as Arc<dyn ControlPlane>;
    let state = AppState::new(control);
    let forwarding = runtime.forward_to(&state.tx);
    Harness {
        state: Arc::new(state),
        _forwarding: forwarding,
    }
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn call(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = build_router(Arc::clone(state))
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

#[tokio::test]
async fn status_reports_a_stopped_loop_and_free_lock() {
    let harness = make_harness();
    let (status, json) = call(&harness.state, "GET", "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["lock"]["held"], false);
    assert_eq!(json["evolution"]["is_running"], false);
    assert_eq!(json["ledger"]["known_ids"], 0);
}

#[tokio::test]
async fn start_is_idempotent() {
    let harness = make_harness();

    let (status, json) = call(&harness.state, "POST", "/api/evolution/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["changed"], true);
    assert_eq!(json["phase"], "running");

    let (_, json) = call(&harness.state, "POST", "/api/evolution/start").await;
    assert_eq!(json["changed"], false);

    let (_, json) = call(&harness.state, "POST", "/api/evolution/pause").await;
    assert_eq!(json["phase"], "paused");
    let (_, json) = call(&harness.state, "POST", "/api/evolution/resume").await;
    assert_eq!(json["phase"], "running");
    let (_, json) = call(&harness.state, "POST", "/api/evolution/stop").await;
    assert_eq!(json["phase"], "stopped");
}

#[tokio::test]
async fn forced_batch_requires_a_running_loop() {
    let harness = make_harness();
    let (status, json) = call(&harness.state, "POST", "/api/evolution/batch/cloud").await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["status"], 409);
}

#[tokio::test]
async fn forced_batch_rejects_unknown_pool() {
    let harness = make_harness();
    let (status, _) = call(&harness.state, "POST", "/api/evolution/batch/gpu").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forced_batch_analyzes_and_marks_games() {
    let harness = make_harness();
    call(&harness.state, "POST", "/api/evolution/start").await;

    let (status, json) = call(&harness.state, "POST", "/api/evolution/batch/local").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["delta"], 3);

    let (_, json) = call(&harness.state, "GET", "/api/status").await;
    assert_eq!(json["evolution"]["total_count"], 3);
    assert_eq!(json["ledger"]["known_ids"], 3);

    // Everything the feed offers is now known.
    let (_, json) = call(&harness.state, "POST", "/api/evolution/batch/local").await;
    assert_eq!(json["delta"], 0);
}

#[tokio::test]
async fn lock_round_trip_pauses_and_restores_the_loop() {
    let harness = make_harness();
    call(&harness.state, "POST", "/api/evolution/start").await;

    let (status, json) = call(&harness.state, "POST", "/api/lock/acquire").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["held"], true);
    assert_eq!(json["was_running"], true);

    let (_, json) = call(&harness.state, "GET", "/api/status").await;
    assert_eq!(json["evolution"]["is_paused"], true);

    let (status, _) = call(&harness.state, "POST", "/api/lock/clear-remote").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, json) = call(&harness.state, "POST", "/api/lock/release").await;
    assert_eq!(json["ok"], true);

    let (_, json) = call(&harness.state, "GET", "/api/status").await;
    assert_eq!(json["lock"]["held"], false);
    assert_eq!(json["evolution"]["is_paused"], false);

    let (_, json) = call(&harness.state, "POST", "/api/lock/release").await;
    assert_eq!(json["ok"], false);
}

#[tokio::test(start_paused = true)]
async fn abandoned_acquire_request_can_still_be_released() {
    let harness = make_harness_with_settle(500);
    call(&harness.state, "POST", "/api/evolution/start").await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        call(&harness.state, "POST", "/api/lock/acquire"),
    )
    .await;
    assert!(abandoned.is_err());

    let (_, json) = call(&harness.state, "GET", "/api/status").await;
    assert_eq!(json["lock"]["held"], true);
    assert_eq!(json["evolution"]["is_paused"], true);

    let (_, json) = call(&harness.state, "POST", "/api/lock/release").await;
    assert_eq!(json["ok"], true);
    let (_, json) = call(&harness.state, "GET", "/api/status").await;
    assert_eq!(json["lock"]["held"], false);
    assert_eq!(json["evolution"]["is_paused"], false);
}

#[tokio::test]
async fn clear_remote_succeeds_when_not_held() {
    let harness = make_harness();
    let (status, json) = call(&harness.state, "POST", "/api/lock/clear-remote").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
}

#[tokio::test]
async fn stream_carries_evolution_events_and_lock_transitions() {
    let harness = make_harness();
    let mut rx = harness.state.subscribe();

    call(&harness.state, "POST", "/api/evolution/start").await;
    call(&harness.state, "POST", "/api/lock/acquire").await;
    call(&harness.state, "POST", "/api/lock/release").await;

    let first = rx.recv().await.unwrap();
    assert!(matches!(
        first,
        StreamMessage::Evolution {
            event: EvolutionEvent::EngineStarted { .. }
        }
    ));
    assert_eq!(rx.recv().await.unwrap(), StreamMessage::Lock { held: true });
    assert_eq!(rx.recv().await.unwrap(), StreamMessage::Lock { held: false });
}

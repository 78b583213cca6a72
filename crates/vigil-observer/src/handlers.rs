//! REST handlers for the operator API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/status` | Lock, evolution, and ledger status |
//! | `POST` | `/api/lock/acquire` | Open a manual session |
//! | `POST` | `/api/lock/release` | End the manual session |
//! | `POST` | `/api/lock/clear-remote` | Clear another process's lock record |
//! | `POST` | `/api/evolution/start` | Start the loop |
//! | `POST` | `/api/evolution/stop` | Stop the loop |
//! | `POST` | `/api/evolution/pause` | Pause the loop |
//! | `POST` | `/api/evolution/resume` | Resume the loop |
//! | `POST` | `/api/evolution/batch/{pool}` | Run one batch now |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::info;
use vigil_types::{EvolutionPhase, Pool};

use crate::error::ObserverError;
use crate::state::AppState;

/// Generic action response.
#[derive(Debug, Serialize)]
struct ActionResponse {
    /// Whether the call changed anything.
    ok: bool,
    /// Human-readable message.
    message: String,
}

/// Response of the evolution lifecycle endpoints.
#[derive(Debug, Serialize)]
struct LifecycleResponse {
    /// Whether the call caused a transition.
    changed: bool,
    /// Phase after the call.
    phase: EvolutionPhase,
}

/// `GET /api/status`
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.control.status())
}

/// `POST /api/lock/acquire`
///
/// Waits until the loop has been paused and has settled, then returns the
/// lock snapshot. Acquiring an already held lock returns immediately.
pub async fn acquire_lock(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.control.acquire_lock().await;
    info!(owner = %snapshot.owner, "manual session opened via API");
    Json(snapshot)
}

/// `POST /api/lock/release`
pub async fn release_lock(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let released = state.control.release_lock().await;
    Json(ActionResponse {
        ok: released,
        message: if released {
            "Lock released".to_owned()
        } else {
            "Lock was not held".to_owned()
        },
    })
}

/// `POST /api/lock/clear-remote`
///
/// Refused while this process holds the lock itself.
pub async fn clear_remote_lock(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    if state.control.status().lock.held {
        return Err(ObserverError::Conflict(
            "lock is held by this process; release it instead".to_owned(),
        ));
    }
    let cleared = state.control.clear_remote_lock().await;
    Ok(Json(ActionResponse {
        ok: cleared,
        message: if cleared {
            "Lock record cleared".to_owned()
        } else {
            "Lock record not cleared".to_owned()
        },
    }))
}

fn lifecycle(state: &AppState, changed: bool) -> Json<LifecycleResponse> {
    Json(LifecycleResponse {
        changed,
        phase: state.control.status().evolution.phase(),
    })
}

/// `POST /api/evolution/start`
pub async fn start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.control.start();
    lifecycle(&state, changed)
}

/// `POST /api/evolution/stop`
pub async fn stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.control.stop();
    lifecycle(&state, changed)
}

/// `POST /api/evolution/pause`
pub async fn pause(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.control.pause();
    lifecycle(&state, changed)
}

/// `POST /api/evolution/resume`
pub async fn resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.control.resume();
    lifecycle(&state, changed)
}

/// `POST /api/evolution/batch/{pool}`
///
/// Returns 409 unless the loop is running, 400 for an unknown pool, and
/// 200 with the [`BatchOutcome`](vigil_core::evolution::BatchOutcome)
/// otherwise (a failed batch is still a 200 with `"outcome": "failed"`).
pub async fn force_batch(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> Result<impl IntoResponse, ObserverError> {
    let pool: Pool = pool.parse().map_err(ObserverError::InvalidRequest)?;
    let outcome = state.control.force_batch(pool).await?;
    Ok(Json(outcome))
}

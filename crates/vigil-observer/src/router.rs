//! Axum router construction for the operator API.
//!
//! Assembles all routes (REST + `WebSocket`) into a single [`Router`]
//! with CORS middleware enabled for cross-origin dashboard access.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router for the operator server.
///
/// See [`handlers`] for the REST table. `GET /ws/events` upgrades to the
/// event stream.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/events", get(ws::ws_events))
        .route("/api/status", get(handlers::status))
        .route("/api/lock/acquire", post(handlers::acquire_lock))
        .route("/api/lock/release", post(handlers::release_lock))
        .route("/api/lock/clear-remote", post(handlers::clear_remote_lock))
        .route("/api/evolution/start", post(handlers::start))
        .route("/api/evolution/stop", post(handlers::stop))
        .route("/api/evolution/pause", post(handlers::pause))
        .route("/api/evolution/resume", post(handlers::resume))
        .route("/api/evolution/batch/{pool}", post(handlers::force_batch))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

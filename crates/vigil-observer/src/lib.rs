//! Operator API server for the Vigil analysis coordinator.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **Status** (`GET /api/status`): lock snapshot, evolution counters, and
//!   ledger size in one document
//! - **Lock endpoints** for manual sessions (acquire, release, clearing a
//!   stale record left by another process)
//! - **Evolution endpoints** (start, stop, pause, resume, forced batch)
//! - **`WebSocket` endpoint** (`/ws/events`) streaming evolution events and
//!   lock transitions via [`tokio::sync::broadcast`]
//!
//! # Architecture
//!
//! Handlers talk to the coordination core through the object-safe
//! [`ControlPlane`] trait so the router does not carry the engine, feed,
//! and store type parameters. [`Runtime`] is the production
//! implementation over an [`EvolutionLoop`] and its [`LockCoordinator`].
//!
//! [`EvolutionLoop`]: vigil_core::evolution::EvolutionLoop
//! [`LockCoordinator`]: vigil_core::coordinator::LockCoordinator

pub mod control;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use control::{ControlPlane, LedgerStatus, Runtime, StatusReport};
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::{AppState, StreamMessage};

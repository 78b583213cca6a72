//! Data layer for Vigil (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` holds the lock record so other processes see a manual
//! session within one poll. `PostgreSQL` holds the analyzed-game ledger and
//! evolution telemetry, and stands in for `Dragonfly` when none is
//! configured.
//!
//! # Architecture
//!
//! ```text
//! LockCoordinator --- upsert/get lock record ---> Dragonfly (or coordination_locks)
//! DedupLedger ------- paged id reads -----------> analyzed_games
//! EvolutionLoop ----- fire-and-forget inserts --> evolution_events
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) JSON records
//! - [`postgres`] -- `PostgreSQL` connection pool and migrations
//! - [`store`] -- [`VigilStore`], the `RecordStore` over both backends
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod postgres;
pub mod store;

pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use postgres::PostgresPool;
pub use store::{ANALYZED_GAMES, EVOLUTION_EVENTS, VigilStore};

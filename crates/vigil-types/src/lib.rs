//! Shared type definitions for the Vigil analysis coordinator.
//!
//! This crate is the single source of truth for the records and state
//! snapshots that cross crate boundaries. Types flow downstream to
//! `TypeScript` via `ts-rs` for the operator dashboard.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers (lock owners, batches)
//! - [`enums`] -- Pools and evolution phases
//! - [`structs`] -- Game records, lock records, state snapshots
//! - [`events`] -- Evolution loop events

pub mod enums;
pub mod events;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{EvolutionPhase, Pool};
pub use events::EvolutionEvent;
pub use ids::{BatchId, OwnerId};
pub use structs::{EvolutionState, GameRecord, LockRecord, LockSnapshot};

//! Coordination core of the Vigil analysis coordinator.
//!
//! The autonomous loop and manual operator sessions share one scarce,
//! serializing analysis engine. This crate keeps them from contending for
//! it and keeps the loop from analyzing the same game twice.
//!
//! # Modules
//!
//! - [`coordinator`] -- [`LockCoordinator`], the advisory lock manual
//!   sessions take, and the [`LockSignal`] the loop watches.
//! - [`evolution`] -- [`EvolutionLoop`], the run/pause/stop state machine
//!   with per-pool triggers and failure recovery.
//! - [`ledger`] -- [`DedupLedger`], known game ids with a bounded,
//!   paginated, single-flight initialization.
//! - [`store`] -- the [`RecordStore`] collaborator and an in-memory store.
//! - [`engine`] -- the [`AnalysisEngine`] and [`GameFeed`] collaborators.
//! - [`cancel`] -- cooperative cancellation tokens.
//! - [`pubsub`] -- typed listeners with unsubscribe handles.
//! - [`config`] -- `vigil-config.yaml` loading.
//!
//! [`LockCoordinator`]: coordinator::LockCoordinator
//! [`LockSignal`]: coordinator::LockSignal
//! [`EvolutionLoop`]: evolution::EvolutionLoop
//! [`DedupLedger`]: ledger::DedupLedger
//! [`RecordStore`]: store::RecordStore
//! [`AnalysisEngine`]: engine::AnalysisEngine
//! [`GameFeed`]: engine::GameFeed

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod evolution;
pub mod ledger;
pub mod pubsub;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

//! Core record and state structs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{EvolutionPhase, Pool};
use crate::ids::OwnerId;

/// A game record as delivered by an upstream provider feed.
///
/// Providers disagree on which field carries the identifier, so both
/// `game_id` and `id` are accepted; `game_id` wins when both are set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GameRecord {
    /// Provider-assigned identifier, possibly prefixed with the provider tag.
    #[serde(default)]
    pub game_id: Option<String>,
    /// Alternate identifier field used by some feeds.
    #[serde(default)]
    pub id: Option<String>,
    /// Originating provider (e.g. `lichess`).
    #[serde(default)]
    pub provider: Option<String>,
    /// Game moves in PGN.
    #[serde(default)]
    pub pgn: Option<String>,
    /// When the game was played, if the feed reports it.
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}

impl GameRecord {
    /// Build a record carrying only an identifier.
    pub fn with_id(game_id: impl Into<String>) -> Self {
        Self {
            game_id: Some(game_id.into()),
            ..Self::default()
        }
    }

    /// The record's identifier, ignoring empty strings.
    pub fn identifier(&self) -> Option<&str> {
        self.game_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.id.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Persisted singleton that lets a separate process observe a manual hold.
///
/// The record is advisory: writes are last-writer-wins and there is no
/// compare-and-swap. Readers treat a record past `expires_at` as unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct LockRecord {
    /// Lock name, also the storage key.
    pub key: String,
    /// Whether a manual session currently holds the engine.
    pub locked: bool,
    /// Coordinator instance that wrote the record.
    pub owner: OwnerId,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// After this instant readers ignore `locked`.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Whether the record asserts a hold that has not yet expired at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.expires_at.is_none_or(|at| now < at)
    }
}

/// Counters and status of the autonomous evolution loop.
///
/// Only the state machine's own transition handlers mutate this; everyone
/// else receives clones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct EvolutionState {
    /// Whether the loop has been started and not stopped.
    pub is_running: bool,
    /// Whether the loop is running but paused.
    pub is_paused: bool,
    /// Games analyzed since the current session started.
    pub session_count: u64,
    /// Games analyzed since process start.
    pub total_count: u64,
    /// Games analyzed per pool since process start.
    pub pool_counts: BTreeMap<Pool, u64>,
    /// Failed batches since the last success or recovery.
    pub consecutive_errors: u32,
    /// Recovery routines executed since process start.
    pub recovery_count: u32,
    /// When the current session started.
    pub session_started_at: Option<DateTime<Utc>>,
    /// When a batch last succeeded.
    pub last_success_at: Option<DateTime<Utc>>,
    /// When a batch last failed.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Human-readable per-pool status line.
    pub pool_status: BTreeMap<Pool, String>,
}

impl EvolutionState {
    /// Derive the lifecycle phase from the running/paused flags.
    pub const fn phase(&self) -> EvolutionPhase {
        match (self.is_running, self.is_paused) {
            (false, _) => EvolutionPhase::Stopped,
            (true, false) => EvolutionPhase::Running,
            (true, true) => EvolutionPhase::Paused,
        }
    }

    /// Analyzed count for one pool.
    pub fn pool_count(&self, pool: Pool) -> u64 {
        self.pool_counts.get(&pool).copied().unwrap_or(0)
    }
}

/// Diagnostic snapshot of a lock coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct LockSnapshot {
    /// Whether a manual session holds the lock.
    pub held: bool,
    /// Whether the loop was running (and unpaused) when the lock was taken.
    pub was_running: bool,
    /// Whether the loop was already paused when the lock was taken.
    pub was_paused: bool,
    /// Milliseconds the lock has been held, if held.
    pub held_for_ms: Option<u64>,
    /// Whether another process's unexpired record currently asserts a hold.
    pub remote_held: bool,
    /// This coordinator's owner tag.
    pub owner: OwnerId,
}

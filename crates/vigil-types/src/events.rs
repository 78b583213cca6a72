//! Events emitted by the evolution loop.
//!
//! Every variant carries incremental data (the change that just happened),
//! never cumulative totals, so consumers can render deltas directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::Pool;
use crate::ids::BatchId;

/// A lifecycle or batch event from the evolution loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "event", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EvolutionEvent {
    /// The loop transitioned to running.
    EngineStarted {
        /// Start of the session this run belongs to.
        session_started_at: DateTime<Utc>,
    },
    /// The loop transitioned to stopped.
    EngineStopped {
        /// Games analyzed during the session that just ended.
        session_count: u64,
    },
    /// A batch finished successfully.
    BatchComplete {
        /// Batch identifier.
        batch_id: BatchId,
        /// Pool the batch ran against.
        pool: Pool,
        /// Games analyzed in this batch.
        delta: u64,
    },
    /// The recovery routine ran after repeated batch failures.
    RecoveryComplete {
        /// Consecutive failures that triggered the recovery.
        after_errors: u32,
    },
}

impl EvolutionEvent {
    /// Stable event name used for telemetry rows.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "engine_started",
            Self::EngineStopped { .. } => "engine_stopped",
            Self::BatchComplete { .. } => "batch_complete",
            Self::RecoveryComplete { .. } => "recovery_complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tag() {
        let event = EvolutionEvent::BatchComplete {
            batch_id: BatchId::new(),
            pool: Pool::Cloud,
            delta: 7,
        };
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json.get("event").and_then(|v| v.as_str()), Some("batch_complete"));
        assert_eq!(json.get("delta").and_then(serde_json::Value::as_u64), Some(7));
        assert_eq!(event.name(), "batch_complete");
    }
}

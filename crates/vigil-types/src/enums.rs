//! Enumeration types shared across the workspace.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Compute pool a batch is scheduled against.
///
/// Each pool has its own periodic trigger and its own counters in
/// [`EvolutionState`](crate::EvolutionState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Pool {
    /// Remote engine capacity.
    Cloud,
    /// Engine running on the same host.
    Local,
}

impl Pool {
    /// Every pool, in scheduling order.
    pub const ALL: [Self; 2] = [Self::Cloud, Self::Local];

    /// Stable lowercase name used in logs and persisted rows.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

impl core::fmt::Display for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Pool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown pool: {other}")),
        }
    }
}

/// Lifecycle phase of the autonomous evolution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EvolutionPhase {
    /// No scheduled work. Initial phase at process start.
    #[default]
    Stopped,
    /// Periodic triggers fire and run batches.
    Running,
    /// Triggers keep ticking but every tick is a no-op.
    Paused,
}

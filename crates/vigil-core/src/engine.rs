//! Analysis engine and game feed collaborators.
//!
//! The engine's algorithm is external; the loop only needs to hand it a
//! [`WorkUnit`] under a deadline and reset its adapter state during
//! recovery.

use std::future::Future;
use std::time::Duration;

use vigil_resilience::{ResilienceError, TransientSignal};
use vigil_types::{BatchId, GameRecord, Pool};

use crate::cancel::CancelToken;

/// One batch of fresh games handed to the engine.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Batch this unit belongs to.
    pub batch_id: BatchId,
    /// Pool the batch was scheduled against.
    pub pool: Pool,
    /// Games not yet analyzed.
    pub games: Vec<GameRecord>,
    /// Cancelled when the loop must yield the engine mid-batch.
    pub cancel: CancelToken,
}

/// Result reported by the engine for a [`WorkUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOutcome {
    /// Whether the engine accepted and finished the unit.
    pub success: bool,
    /// Number of games analyzed.
    pub items: u64,
}

/// Failures from the engine or a feed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The payload was malformed or refused.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The work unit was cancelled before completion.
    #[error("analysis cancelled")]
    Cancelled,

    /// The engine did not answer within its deadline.
    #[error("engine deadline of {0}ms exceeded")]
    Deadline(u64),

    /// The local limiter refused the call.
    #[error(transparent)]
    RateLimited(#[from] ResilienceError),
}

impl TransientSignal for EngineError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RateLimited(_) => Some(429),
            _ => None,
        }
    }

    fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Deadline(_))
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(limited) => limited.retry_after_hint(),
            _ => None,
        }
    }
}

/// The scarce, serializing analysis engine.
pub trait AnalysisEngine: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Analyze `unit`, giving up after `deadline`.
    fn analyze(
        &self,
        unit: &WorkUnit,
        deadline: Duration,
    ) -> impl Future<Output = Result<AnalysisOutcome, EngineError>> + Send;

    /// Drop any adapter state (connections, warm caches) after repeated failures.
    fn reset(&self);
}

/// Source of candidate games for a pool.
pub trait GameFeed: Send + Sync + 'static {
    /// Fetch up to `limit` recent games for `pool`.
    fn fetch(
        &self,
        pool: Pool,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<GameRecord>, EngineError>> + Send;
}

//! HTTP clients for the analysis engine and the game feed.
//!
//! Both speak JSON over `reqwest`. An upstream `429` carrying a
//! `Retry-After` header is mirrored into the shared limiter so the next
//! attempts are refused locally until the upstream window reopens.
//!
//! Engine protocol:
//! - `POST {engine_url}/analyze` with `{ batch_id, pool, games }`, answered
//!   by `{ success, items }`
//! - `POST {engine_url}/reset` during recovery
//!
//! Feed protocol: `GET {feed_url}/games?pool=..&limit=..` answered by a
//! JSON array of game records.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, warn};
use vigil_core::engine::{AnalysisEngine, AnalysisOutcome, EngineError, GameFeed, WorkUnit};
use vigil_resilience::SlidingWindowLimiter;
use vigil_types::{GameRecord, Pool};

/// Seconds from a delta-seconds `Retry-After` header. HTTP-date values
/// are ignored.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn transport_error(error: &reqwest::Error, deadline_ms: u64) -> EngineError {
    if error.is_timeout() {
        EngineError::Deadline(deadline_ms)
    } else {
        EngineError::Transport(error.to_string())
    }
}

/// Turn a non-success response into an [`EngineError`], honoring
/// `Retry-After` on `429` for `limiter_key`.
async fn status_error(
    response: Response,
    limiter: &SlidingWindowLimiter,
    limiter_key: &str,
) -> EngineError {
    let status = response.status().as_u16();
    if status == 429
        && let Some(secs) = retry_after_secs(response.headers())
    {
        warn!(key = limiter_key, retry_after_secs = secs, "upstream rate limit");
        limiter.record_external_limit(limiter_key, secs);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read error body".to_owned());
    EngineError::Status { status, message }
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    success: bool,
    #[serde(default)]
    items: u64,
}

/// [`AnalysisEngine`] reached over HTTP.
#[derive(Debug)]
pub struct HttpEngine {
    client: Client,
    base_url: String,
    limiter: Arc<SlidingWindowLimiter>,
}

impl HttpEngine {
    /// Create a client for the engine at `base_url`.
    pub fn new(base_url: &str, limiter: Arc<SlidingWindowLimiter>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            limiter,
        })
    }

    async fn post_unit(&self, unit: &WorkUnit, deadline: Duration) -> Result<AnalysisOutcome, EngineError> {
        let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        let body = serde_json::json!({
            "batch_id": unit.batch_id,
            "pool": unit.pool,
            "games": unit.games,
        });
        let response = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&e, deadline_ms))?;

        if !response.status().is_success() {
            let key = format!("engine:{}", unit.pool);
            return Err(status_error(response, &self.limiter, &key).await);
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Rejected(format!("engine response parse failed: {e}")))?;
        Ok(AnalysisOutcome {
            success: parsed.success,
            items: parsed.items,
        })
    }
}

impl AnalysisEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn analyze(
        &self,
        unit: &WorkUnit,
        deadline: Duration,
    ) -> Result<AnalysisOutcome, EngineError> {
        unit.cancel
            .run_until_cancelled(self.post_unit(unit, deadline))
            .await
            .unwrap_or(Err(EngineError::Cancelled))
    }

    fn reset(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, skipping engine reset");
            return;
        };
        let request = self.client.post(format!("{}/reset", self.base_url));
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => debug!("engine reset"),
                Ok(response) => warn!(status = %response.status(), "engine reset refused"),
                Err(e) => warn!(error = %e, "engine reset failed"),
            }
        });
    }
}

/// [`GameFeed`] reached over HTTP.
#[derive(Debug)]
pub struct HttpFeed {
    client: Client,
    base_url: String,
    limiter: Arc<SlidingWindowLimiter>,
    timeout: Duration,
}

impl HttpFeed {
    /// Create a client for the feed at `base_url`. Each request is bounded
    /// by `timeout`.
    pub fn new(
        base_url: &str,
        limiter: Arc<SlidingWindowLimiter>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            limiter,
            timeout,
        })
    }
}

impl GameFeed for HttpFeed {
    async fn fetch(&self, pool: Pool, limit: usize) -> Result<Vec<GameRecord>, EngineError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let response = self
            .client
            .get(format!("{}/games", self.base_url))
            .query(&[("pool", pool.as_str().to_owned()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(|e| transport_error(&e, timeout_ms))?;

        if !response.status().is_success() {
            let key = format!("feed:{pool}");
            return Err(status_error(response, &self.limiter, &key).await);
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Rejected(format!("feed response parse failed: {e}")))
    }
}

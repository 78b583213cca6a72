//! Error types for the operator API.
//!
//! [`ObserverError`] unifies all failure modes into a single enum that
//! can be converted into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vigil_core::evolution::EvolutionError;

/// Errors that can occur in the operator API layer.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// An invalid path or query parameter was provided.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is not allowed in the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator (feed, engine) failed while serving the request.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EvolutionError> for ObserverError {
    fn from(err: EvolutionError) -> Self {
        match err {
            EvolutionError::NotRunning(_) => Self::Conflict(err.to_string()),
            EvolutionError::Feed(_) | EvolutionError::Analysis(_) | EvolutionError::Unsuccessful => {
                Self::Upstream(err.to_string())
            }
        }
    }
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Self::Serialization(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("JSON error: {e}"))
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use vigil_types::EvolutionPhase;

    use super::*;

    #[test]
    fn not_running_is_a_conflict() {
        let err = ObserverError::from(EvolutionError::NotRunning(EvolutionPhase::Stopped));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn unsuccessful_analysis_is_upstream() {
        let err = ObserverError::from(EvolutionError::Unsuccessful);
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}

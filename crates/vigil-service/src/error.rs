//! Error types for the Vigil binary.
//!
//! [`AppError`] is the top-level error type that wraps all possible
//! failure modes during startup and serving.

/// Top-level error for the Vigil binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: vigil_core::config::ConfigError,
    },

    /// A storage backend could not be reached or migrated.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying data layer error.
        #[from]
        source: vigil_db::DbError,
    },

    /// An HTTP client could not be built.
    #[error("HTTP client error: {source}")]
    Http {
        /// The underlying client error.
        #[from]
        source: reqwest::Error,
    },

    /// The operator API server failed.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying server error.
        #[from]
        source: vigil_observer::ServerError,
    },
}

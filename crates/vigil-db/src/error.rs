//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] and [`fred`] errors. At the [`RecordStore`] boundary they are
//! mapped to [`StoreError`] so the core can tell an unreachable backend
//! (worth retrying) from everything else.
//!
//! [`RecordStore`]: vigil_core::store::RecordStore

use vigil_core::store::StoreError;

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The table is not one this store reads or writes.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// No backend is configured for the operation.
    #[error("No backend configured for {0}")]
    NoBackend(&'static str),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether the failure means the backend could not be reached.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Postgres(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Self::Dragonfly(e) => matches!(
                e.kind(),
                fred::error::ErrorKind::IO
                    | fred::error::ErrorKind::Timeout
                    | fred::error::ErrorKind::Canceled
            ),
            Self::NoBackend(_) => true,
            _ => false,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(error: DbError) -> Self {
        if error.is_connectivity() {
            return Self::Unavailable(error.to_string());
        }
        match error {
            DbError::Serialization(e) => Self::Serialization(e),
            DbError::UnknownTable(table) => Self::UnknownTable(table),
            other => Self::Backend(other.to_string()),
        }
    }
}

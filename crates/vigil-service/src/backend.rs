//! Storage backend selection.
//!
//! Uses enum dispatch so the loop, ledger, and coordinator are
//! monomorphized once regardless of which backend the configuration
//! picks.

use serde_json::Value;
use tracing::info;
use vigil_core::config::InfrastructureConfig;
use vigil_core::store::{MemoryStore, RecordStore, StoreError};
use vigil_db::{DbError, VigilStore};

/// The store behind every component of the service.
#[derive(Debug)]
pub enum Backend {
    /// Process-local storage. Nothing survives a restart.
    Memory(MemoryStore),
    /// `PostgreSQL` and/or `Dragonfly`.
    Persistent(VigilStore),
}

impl Backend {
    /// Connect the configured backends, or fall back to memory when no
    /// URL is set.
    pub async fn connect(infra: &InfrastructureConfig) -> Result<Self, DbError> {
        if infra.postgres_url.is_empty() && infra.dragonfly_url.is_empty() {
            info!("No storage URLs configured, using in-memory store");
            return Ok(Self::Memory(MemoryStore::new()));
        }
        let store = VigilStore::connect(infra).await?;
        info!(
            postgres = !infra.postgres_url.is_empty(),
            dragonfly = !infra.dragonfly_url.is_empty(),
            "Persistent store connected"
        );
        Ok(Self::Persistent(store))
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Memory(_) => "memory",
            Self::Persistent(_) => "persistent",
        }
    }
}

impl Backend {
    /// Close persistent connections. Memory needs no teardown.
    pub async fn close(&self) {
        if let Self::Persistent(store) = self {
            store.close().await;
        }
    }
}

impl RecordStore for Backend {
    async fn upsert_by_key(&self, key: &str, record: Value) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.upsert_by_key(key, record).await,
            Self::Persistent(store) => store.upsert_by_key(key, record).await,
        }
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self {
            Self::Memory(store) => store.get_by_key(key).await,
            Self::Persistent(store) => store.get_by_key(key).await,
        }
    }

    async fn select_range(
        &self,
        table: &str,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<Value>, StoreError> {
        match self {
            Self::Memory(store) => store.select_range(table, offset, limit).await,
            Self::Persistent(store) => store.select_range(table, offset, limit).await,
        }
    }

    async fn insert(&self, table: &str, record: Value) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.insert(table, record).await,
            Self::Persistent(store) => store.insert(table, record).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn empty_urls_select_memory() {
        let infra = InfrastructureConfig {
            postgres_url: String::new(),
            dragonfly_url: String::new(),
            ..InfrastructureConfig::default()
        };
        let backend = Backend::connect(&infra).await.unwrap();
        assert_eq!(backend.name(), "memory");

        backend
            .upsert_by_key("analysis_engine", json!({ "locked": true }))
            .await
            .unwrap();
        let record = backend.get_by_key("analysis_engine").await.unwrap();
        assert_eq!(record, Some(json!({ "locked": true })));

        backend.close().await;
        let record = backend.get_by_key("analysis_engine").await.unwrap();
        assert_eq!(record, Some(json!({ "locked": true })));
    }
}

//! The persistent-store collaborator.
//!
//! The core only ever issues four kinds of operation against storage:
//! a singleton upsert/read keyed by name (the lock record), an ordered
//! paginated read (the dedup ledger), and an append (telemetry). Anything
//! implementing [`RecordStore`] can back the coordinator; `vigil-db`
//! provides the PostgreSQL/Dragonfly implementation and [`MemoryStore`]
//! serves single-process deployments and tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use vigil_resilience::TransientSignal;

/// Errors surfaced by a [`RecordStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The requested table is not one the store serves.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A record could not be encoded or decoded.
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl TransientSignal for StoreError {
    fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Read/write operations the core issues against persistent storage.
pub trait RecordStore: Send + Sync + 'static {
    /// Write the singleton record stored under `key`, replacing any previous value.
    fn upsert_by_key(
        &self,
        key: &str,
        record: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Read the singleton record stored under `key`.
    fn get_by_key(&self, key: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Read up to `limit` rows of `table` starting at `offset`, in a stable order.
    fn select_range(
        &self,
        table: &str,
        offset: u64,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Value>, StoreError>> + Send;

    /// Append one row to `table`.
    fn insert(&self, table: &str, record: Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append one row without waiting for the write. Failures are logged.
    fn insert_fire_and_forget(self: &Arc<Self>, table: &str, record: Value)
    where
        Self: Sized,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(table, "no runtime available, dropping telemetry row");
            return;
        };
        let store = Arc::clone(self);
        let table = table.to_owned();
        runtime.spawn(async move {
            if let Err(e) = store.insert(&table, record).await {
                warn!(table = %table, error = %e, "telemetry insert failed");
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`RecordStore`].
///
/// Besides backing deployments without a database, it can simulate an
/// unreachable backend, a slow page read, or a failing page.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Value>>,
    tables: Mutex<HashMap<String, Vec<Value>>>,
    unavailable: AtomicBool,
    select_delay: Mutex<Option<Duration>>,
    fail_select_at: Mutex<Option<u64>>,
    select_calls: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `rows` to `table`.
    pub fn seed_table(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        lock(&self.tables)
            .entry(table.to_owned())
            .or_default()
            .extend(rows);
    }

    /// Snapshot of every row in `table`.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every page read by `delay`.
    pub fn set_select_delay(&self, delay: Option<Duration>) {
        *lock(&self.select_delay) = delay;
    }

    /// Fail the page read that starts at `offset`.
    pub fn fail_select_at(&self, offset: Option<u64>) {
        *lock(&self.fail_select_at) = offset;
    }

    /// Number of page reads issued so far.
    pub fn select_calls(&self) -> u32 {
        self.select_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl RecordStore for MemoryStore {
    async fn upsert_by_key(&self, key: &str, record: Value) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.keys).insert(key.to_owned(), record);
        debug!(key, "record upserted");
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        Ok(lock(&self.keys).get(key).cloned())
    }

    async fn select_range(
        &self,
        table: &str,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<Value>, StoreError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.select_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        if *lock(&self.fail_select_at) == Some(offset) {
            return Err(StoreError::Backend(format!("page read failed at offset {offset}")));
        }

        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(lock(&self.tables)
            .get(table)
            .map(|rows| rows.iter().skip(skip).take(take).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, record: Value) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.tables)
            .entry(table.to_owned())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn select_range_pages_in_order() {
        let store = MemoryStore::new();
        store.seed_table("games", (0..5).map(|i| json!({ "game_id": format!("g{i}") })));

        let page = store.select_range("games", 2, 2).await.unwrap();
        assert_eq!(page, vec![json!({ "game_id": "g2" }), json!({ "game_id": "g3" })]);

        let tail = store.select_range("games", 4, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(store.select_range("missing", 0, 10).await.unwrap().is_empty());
        assert_eq!(store.select_calls(), 3);
    }

    #[tokio::test]
    async fn upsert_replaces_singleton() {
        let store = MemoryStore::new();
        store.upsert_by_key("lock", json!({ "locked": true })).await.unwrap();
        store.upsert_by_key("lock", json!({ "locked": false })).await.unwrap();
        assert_eq!(
            store.get_by_key("lock").await.unwrap(),
            Some(json!({ "locked": false }))
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_by_key("lock").await.unwrap_err();
        assert!(err.is_transport_failure());
        assert!(store.insert("events", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn fire_and_forget_insert_lands() {
        let store = Arc::new(MemoryStore::new());
        store.insert_fire_and_forget("events", json!({ "event": "engine_started" }));
        for _ in 0..10 {
            if !store.rows("events").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.rows("events").len(), 1);
    }

    #[tokio::test]
    async fn fire_and_forget_swallows_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        store.insert_fire_and_forget("events", json!({}));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(store.rows("events").is_empty());
    }
}

//! [`RecordStore`] over `PostgreSQL` and `Dragonfly`.
//!
//! Keyed singleton records (the lock record) go to `Dragonfly` when one is
//! configured and to the `coordination_locks` table otherwise. Paged reads
//! and appends go to `PostgreSQL` and are limited to the tables the
//! migrations create; any other table name is refused before it reaches
//! SQL.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use vigil_core::config::InfrastructureConfig;
use vigil_core::store::{RecordStore, StoreError};

use crate::dragonfly::{DragonflyPool, lock_key};
use crate::error::DbError;
use crate::postgres::PostgresPool;

/// Table of analyzed game ids.
pub const ANALYZED_GAMES: &str = "analyzed_games";

/// Table of evolution telemetry rows.
pub const EVOLUTION_EVENTS: &str = "evolution_events";

/// Persistent store used by the service.
#[derive(Debug, Clone, Default)]
pub struct VigilStore {
    postgres: Option<PostgresPool>,
    dragonfly: Option<DragonflyPool>,
}

impl VigilStore {
    /// Wrap already-connected backends.
    pub const fn new(postgres: Option<PostgresPool>, dragonfly: Option<DragonflyPool>) -> Self {
        Self {
            postgres,
            dragonfly,
        }
    }

    /// Connect every backend with a non-empty URL and run migrations.
    pub async fn connect(infra: &InfrastructureConfig) -> Result<Self, DbError> {
        let postgres = if infra.postgres_url.is_empty() {
            None
        } else {
            let pool = PostgresPool::connect(&infra.postgres_url).await?;
            pool.run_migrations().await?;
            Some(pool)
        };
        let dragonfly = if infra.dragonfly_url.is_empty() {
            None
        } else {
            Some(DragonflyPool::connect(&infra.dragonfly_url).await?)
        };
        Ok(Self::new(postgres, dragonfly))
    }

    /// Whether any backend is configured.
    pub const fn is_configured(&self) -> bool {
        self.postgres.is_some() || self.dragonfly.is_some()
    }

    /// Close every configured backend. A failed `Dragonfly` quit is
    /// logged; the connection is dropped either way.
    pub async fn close(&self) {
        if let Some(postgres) = &self.postgres {
            postgres.close().await;
        }
        if let Some(dragonfly) = &self.dragonfly
            && let Err(e) = dragonfly.close().await
        {
            tracing::warn!(error = %e, "Dragonfly quit failed");
        }
    }

    fn postgres(&self) -> Result<&PostgresPool, DbError> {
        self.postgres.as_ref().ok_or(DbError::NoBackend("PostgreSQL tables"))
    }

    async fn write_keyed(&self, key: &str, record: &Value) -> Result<(), DbError> {
        if let Some(dragonfly) = &self.dragonfly {
            return dragonfly.set_json(&lock_key(key), record).await;
        }
        sqlx::query(
            "INSERT INTO coordination_locks (key, record, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET record = EXCLUDED.record, updated_at = now()",
        )
        .bind(key)
        .bind(record)
        .execute(self.postgres()?.pool())
        .await?;
        Ok(())
    }

    async fn read_keyed(&self, key: &str) -> Result<Option<Value>, DbError> {
        if let Some(dragonfly) = &self.dragonfly {
            return dragonfly.get_json(&lock_key(key)).await;
        }
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT record FROM coordination_locks WHERE key = $1")
                .bind(key)
                .fetch_optional(self.postgres()?.pool())
                .await?;
        Ok(row.map(|(record,)| record))
    }

    async fn read_page(&self, table: &str, offset: u64, limit: u32) -> Result<Vec<Value>, DbError> {
        let pool = self.postgres()?.pool();
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let limit = i64::from(limit);

        match table {
            ANALYZED_GAMES => {
                let rows: Vec<(String, Option<String>)> = sqlx::query_as(
                    "SELECT game_id, provider FROM analyzed_games \
                     ORDER BY analyzed_at, game_id OFFSET $1 LIMIT $2",
                )
                .bind(offset)
                .bind(limit)
                .fetch_all(pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(game_id, provider)| json!({ "game_id": game_id, "provider": provider }))
                    .collect())
            }
            EVOLUTION_EVENTS => {
                let rows: Vec<(i64, String, Value, DateTime<Utc>)> = sqlx::query_as(
                    "SELECT id, event, payload, recorded_at FROM evolution_events \
                     ORDER BY id OFFSET $1 LIMIT $2",
                )
                .bind(offset)
                .bind(limit)
                .fetch_all(pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(id, event, payload, recorded_at)| {
                        json!({
                            "id": id,
                            "event": event,
                            "payload": payload,
                            "recorded_at": recorded_at,
                        })
                    })
                    .collect())
            }
            other => Err(DbError::UnknownTable(other.to_owned())),
        }
    }

    async fn append(&self, table: &str, record: &Value) -> Result<(), DbError> {
        let pool = self.postgres()?.pool();
        match table {
            ANALYZED_GAMES => {
                let game_id = record
                    .get("game_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DbError::Config("analyzed game row without game_id".to_owned()))?;
                let provider = record.get("provider").and_then(Value::as_str);
                sqlx::query(
                    "INSERT INTO analyzed_games (game_id, provider) VALUES ($1, $2) \
                     ON CONFLICT (game_id) DO NOTHING",
                )
                .bind(game_id)
                .bind(provider)
                .execute(pool)
                .await?;
                Ok(())
            }
            EVOLUTION_EVENTS => {
                let event = record
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let payload = record.get("payload").cloned().unwrap_or(Value::Null);
                sqlx::query("INSERT INTO evolution_events (event, payload) VALUES ($1, $2)")
                    .bind(event)
                    .bind(payload)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            other => Err(DbError::UnknownTable(other.to_owned())),
        }
    }
}

impl RecordStore for VigilStore {
    async fn upsert_by_key(&self, key: &str, record: Value) -> Result<(), StoreError> {
        Ok(self.write_keyed(key, &record).await?)
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_keyed(key).await?)
    }

    async fn select_range(
        &self,
        table: &str,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<Value>, StoreError> {
        Ok(self.read_page(table, offset, limit).await?)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<(), StoreError> {
        Ok(self.append(table, &record).await?)
    }
}

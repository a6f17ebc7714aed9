//!
//! src/persistent.rs  Andrew Belles  Oct 16th, 2026
//!
//! Scoped key/value persistence for work snapshots and the list of extra
//! artists. Backed by sqlite in production and by a map in tests.
//! Last write wins, nothing here is transactional across keys.
//!

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::errors::LinkerError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, LinkerError>;
    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), LinkerError>;
}

pub struct SqliteStore {
    pool: Pool<Sqlite>
}

impl SqliteStore {
    pub async fn init(database_url: &str) -> Result<Self, LinkerError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| LinkerError::Db(
                format!("connecting to sqlite at {database_url}: {e}")
            ))?;

        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL;").execute(&pool).await?;

        Self::ensure_schema(&pool).await?;
        Ok( Self { pool } )
    }

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), LinkerError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS kv (
              scope       TEXT NOT NULL,
              key         TEXT NOT NULL,
              value       TEXT NOT NULL,
              updated_at  INTEGER NOT NULL,
              PRIMARY KEY (scope, key)
            );
            "
        ).execute(pool).await?;

        Ok(())
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, LinkerError> {
        let row = sqlx::query("SELECT value FROM kv WHERE scope = ?1 AND key = ?2;")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), LinkerError> {
        sqlx::query(
            r"
            INSERT INTO kv (scope, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(scope, key) DO UPDATE
               SET value = excluded.value,
                   updated_at = excluded.updated_at;
            "
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In process store, nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
    writes: Mutex<usize>
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls so far
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, LinkerError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), LinkerError> {
        self.entries.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((scope.to_string(), key.to_string()), value.to_string());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_round_trips_and_overwrites() -> Result<(), LinkerError> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite:{}", dir.path().join("kv.db").display());
        let store = SqliteStore::init(&url).await?;

        assert_eq!(store.get("artist-a", "works").await?, None);
        store.set("artist-a", "works", "[1]").await?;
        store.set("artist-a", "works", "[1,2]").await?;
        store.set("artist-b", "works", "[3]").await?;

        assert_eq!(store.get("artist-a", "works").await?.as_deref(), Some("[1,2]"));
        assert_eq!(store.get("artist-b", "works").await?.as_deref(), Some("[3]"));

        // reopening sees the persisted rows
        drop(store);
        let reopened = SqliteStore::init(&url).await?;
        assert_eq!(reopened.get("artist-a", "works").await?.as_deref(), Some("[1,2]"));
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_counts_writes() -> Result<(), LinkerError> {
        let store = MemoryStore::new();
        store.set("s", "k", "v").await?;
        store.set("s", "k", "w").await?;
        assert_eq!(store.get("s", "k").await?.as_deref(), Some("w"));
        assert_eq!(store.writes(), 2);
        Ok(())
    }
}

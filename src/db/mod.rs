//! Database module for Checkup Sync
//!
//! Provides the durable local store: four record collections keyed by
//! store key and indexed by `sync_status`, plus the temp->authoritative key
//! map and the settings table. The legacy request queue creates its own
//! table (see `sync::queue`).

mod collections;

pub use collections::{ImportStats, MergeOutcome};

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::models::EntityKind;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the store at `db_path`
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        Self::initialize(&*pool.get()?, true)?;

        log::info!("Local store opened at {:?}", db_path);
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory store (for testing)
    ///
    /// Every pooled in-memory connection is its own database, so the pool is
    /// capped at a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        Self::initialize(&*pool.get()?, false)?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SCHEMA
    // =========================================================================

    fn initialize(conn: &Connection, wal: bool) -> DbResult<()> {
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA cache_size = -16000;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA temp_store = MEMORY;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(conn)
    }

    /// Bring stores created by older builds up to the current schema
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Re-create collection indexes missing from older or damaged stores
        for kind in EntityKind::DOWNLOAD_ORDER {
            let table = kind.table();
            for column in ["sync_status", "temp_id"] {
                let index = format!("idx_{}_{}", table, column);
                let exists: bool = conn
                    .query_row(
                        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                        [&index],
                        |row| row.get(0),
                    )
                    .unwrap_or(false);

                if !exists {
                    log::info!("Running migration: creating index {}", index);
                    conn.execute_batch(&format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {}({});",
                        index, table, column
                    ))?;
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // RAW SQL
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_creation() {
        let db = Database::in_memory().expect("Failed to create in-memory database");

        for kind in EntityKind::DOWNLOAD_ORDER {
            let count: i64 = db
                .query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| row.get(0))
                .expect("collection table missing");
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_sync_indexes_created() {
        let db = Database::in_memory().unwrap();
        for kind in EntityKind::DOWNLOAD_ORDER {
            assert!(db.has_sync_index(kind).unwrap(), "missing index for {}", kind);
        }
    }

    #[test]
    fn test_settings() {
        let db = Database::in_memory().expect("Failed to create database");

        let missing: Option<String> = db.get_setting("custom_key").expect("Failed to get setting");
        assert!(missing.is_none());

        db.set_setting("custom_key", &"custom_value")
            .expect("Failed to set setting");

        let value: Option<String> = db.get_setting("custom_key").expect("Failed to get setting");
        assert_eq!(value, Some("custom_value".to_string()));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.set_setting("last_run", &"2026-01-01T00:00:00Z").unwrap();
        }

        let db = Database::new(path).unwrap();
        let value: Option<String> = db.get_setting("last_run").unwrap();
        assert_eq!(value.as_deref(), Some("2026-01-01T00:00:00Z"));
    }
}

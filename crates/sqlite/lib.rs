//! SQLite store for the netsched job queue.
//!
//! All queue tables share one physical table keyed by `(tbl, key)`; the
//! database runs in WAL mode and [`PersistentStore::checkpoint`] truncates
//! the log.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use netsched_core::{QueueContext, QueueRegistry, SharedStore};
//! use netsched_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> netsched_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:netsched.db").await?;
//!     let context = QueueContext::builder(SharedStore::new(store)).build();
//!     let registry = QueueRegistry::open(context, Vec::new()).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use netsched_core::{NsError, PersistentStore, Result, StoreTransaction};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::str::FromStr;
use std::time::Duration;

const RECORDS_TABLE: &str = "netsched_records";

/// SQLite result codes (primary, low byte) reported for lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// SQLite-backed [`PersistentStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite database.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| NsError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // one writer; transactions queue on the pool
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| NsError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let store = Self { pool };
        store.init_tables().await?;
        tracing::info!(url = %database_url, "SQLite store opened");
        Ok(store)
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                tbl TEXT NOT NULL,
                key INTEGER NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (tbl, key)
            )
            "#,
            RECORDS_TABLE
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to create records table", e))?;
        Ok(())
    }
}

/// Map a sqlx error, reporting lock contention as a retryable conflict.
fn store_error(context: &str, e: sqlx::Error) -> NsError {
    let contended = match &e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    };
    if contended {
        NsError::Conflict(format!("{}: {}", context, e))
    } else {
        NsError::Backend(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn get(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE tbl = ? AND key = ?",
            RECORDS_TABLE
        ))
        .bind(table)
        .bind(key as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to read record", e))?;
        Ok(row.map(|(value,)| value))
    }

    async fn scan_from(
        &self,
        table: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(&format!(
            "SELECT key, value FROM {} WHERE tbl = ? AND key >= ? ORDER BY key LIMIT ?",
            RECORDS_TABLE
        ))
        .bind(table)
        .bind(from as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to scan records", e))?;
        Ok(rows
            .into_iter()
            .map(|(key, value)| (key as u64, value))
            .collect())
    }

    async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to checkpoint", e))?;
        Ok(())
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE tbl = ?", RECORDS_TABLE))
            .bind(table)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to clear table", e))?;
        Ok(result.rows_affected())
    }
}

/// An open SQLite transaction. Dropping it rolls back.
struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn get(&mut self, table: &str, key: u64) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE tbl = ? AND key = ?",
            RECORDS_TABLE
        ))
        .bind(table)
        .bind(key as i64)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| store_error("Failed to read record", e))?;
        Ok(row.map(|(value,)| value))
    }

    async fn put(&mut self, table: &str, key: u64, value: &[u8]) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (tbl, key, value) VALUES (?, ?, ?) \
             ON CONFLICT (tbl, key) DO UPDATE SET value = excluded.value",
            RECORDS_TABLE
        ))
        .bind(table)
        .bind(key as i64)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| store_error("Failed to write record", e))?;
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: u64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE tbl = ? AND key = ?",
            RECORDS_TABLE
        ))
        .bind(table)
        .bind(key as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| store_error("Failed to delete record", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| store_error("Failed to commit transaction", e))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| store_error("Failed to roll back transaction", e))
    }
}

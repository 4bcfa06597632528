//! SQLite blob backend.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Per-row expiry; expired rows read as absent and are swept on write
//! - Versions drawn from an AUTOINCREMENT sequence, so they are never reused

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{Blob, BlobBackend, BlobKey};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

/// SQLite implementation of BlobBackend.
pub struct SqliteBackend {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteBackend {
    /// Open or create a SQLite backend at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite blob backend at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;

        let backend = Self {
            pool,
            clock: Arc::new(SystemClock),
        };

        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create an in-memory SQLite backend (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;

        let backend = Self {
            pool,
            clock: Arc::new(SystemClock),
        };

        backend.init_schema().await?;
        Ok(backend)
    }

    /// Expire entries against `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS blob_versions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite blob schema initialized");
        Ok(())
    }

    fn now_unix(&self) -> i64 {
        self.clock.unix_now() as i64
    }

    /// `None` (no expiry) for a zero TTL or one the column can't hold.
    fn expires_at(&self, ttl: Duration) -> Option<i64> {
        if ttl.is_zero() {
            return None;
        }
        i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| self.now_unix().checked_add(secs))
    }

    /// Take the next version from the sequence.
    async fn next_version(tx: &mut Transaction<'_, Sqlite>) -> Result<u64> {
        let seq = sqlx::query("INSERT INTO blob_versions DEFAULT VALUES")
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();
        // AUTOINCREMENT keeps the high-water mark in sqlite_sequence.
        sqlx::query("DELETE FROM blob_versions")
            .execute(&mut **tx)
            .await?;
        Ok(seq as u64)
    }

    async fn live_version(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: &BlobKey,
    ) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM blobs WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key.as_str())
        .bind(self.now_unix())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|(v,)| v as u64).unwrap_or(0))
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: &BlobKey,
        value: &[u8],
        version: u64,
        ttl: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blobs (key, value, version, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .bind(version as i64)
        .bind(self.expires_at(ttl))
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM blobs WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(self.now_unix())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for SqliteBackend {
    async fn get(&self, key: &BlobKey) -> Result<Option<Blob>> {
        let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
            "SELECT value, version FROM blobs WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key.as_str())
        .bind(self.now_unix())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value, version)| Blob {
            value,
            version: version as u64,
        }))
    }

    async fn set(&self, key: &BlobKey, value: Vec<u8>, ttl: Duration) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let version = Self::next_version(&mut tx).await?;
        self.upsert(&mut tx, key, &value, version, ttl).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        sqlx::query("DELETE FROM blobs WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        sqlx::query("DELETE FROM blobs").execute(&self.pool).await?;
        info!("Flushed SQLite blob backend");
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &BlobKey,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let current_version = self.live_version(&mut tx, key).await?;
        if current_version != expected_version {
            return Err(CacheError::VersionConflict {
                expected: expected_version,
                found: current_version,
            });
        }

        let version = Self::next_version(&mut tx).await?;
        self.upsert(&mut tx, key, &value, version, ttl).await?;
        tx.commit().await?;
        Ok(version)
    }
}

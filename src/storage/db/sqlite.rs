//! Pooled SQLite connections for the ingest database.
//!
//! Every connection runs in WAL mode so readers never block the flush path.
//! Write transactions open with `BEGIN IMMEDIATE`: the write lock is taken up
//! front and a second writer waits in the busy handler instead of failing
//! halfway through with a stale snapshot.

use std::str::FromStr;
use std::time::Duration;

use sqlx::Transaction;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool, SqlitePoolOptions,
    SqliteSynchronous,
};

use crate::storage::StorageError;

/// Pool size used by [`SqlitePool::connect`].
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How long a caller waits for a free pooled connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a writer waits for the database lock before `SQLITE_BUSY`.
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// Shared handle to the ingest database.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool")
            .field("size", &self.inner.size())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl SqlitePool {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open `url` (for example `sqlite:data/logbill.db?mode=rwc`), creating
    /// the file when missing, with at most `max_connections` pooled handles.
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(WRITE_LOCK_TIMEOUT)
            .create_if_missing(true);

        let inner = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        Ok(Self { inner })
    }

    /// Pool for plain reads and single-statement writes.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Start a transaction that holds the write lock from its first statement.
    ///
    /// Use this for any transaction that reads before it writes.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        Ok(self.inner.begin_with(BEGIN_WRITE).await?)
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn file_pool(dir: &tempfile::TempDir, name: &str) -> SqlitePool {
        let url = format!("sqlite:{}?mode=rwc", dir.path().join(name).display());
        SqlitePool::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_memory_pool_close() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let (one,): (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(one, 1);

        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_connection_pragmas() {
        let dir = tempdir().unwrap();
        let pool = file_pool(&dir, "pragmas.db").await;

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(mode, "wal");

        let (busy,): (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(busy, WRITE_LOCK_TIMEOUT.as_millis() as i64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_read_then_write_transactions_serialize() {
        let dir = tempdir().unwrap();
        let pool = file_pool(&dir, "counter.db").await;
        sqlx::query("CREATE TABLE counter (id INTEGER PRIMARY KEY, n INTEGER NOT NULL)")
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query("INSERT INTO counter (id, n) VALUES (1, 0)")
            .execute(pool.inner())
            .await
            .unwrap();

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let pool = pool.clone();
            workers.spawn(async move {
                for _ in 0..25 {
                    let mut tx = pool.begin_write().await?;
                    let (n,): (i64,) = sqlx::query_as("SELECT n FROM counter WHERE id = 1")
                        .fetch_one(&mut *tx)
                        .await?;
                    tokio::task::yield_now().await;
                    sqlx::query("UPDATE counter SET n = ? WHERE id = 1")
                        .bind(n + 1)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                }
                Ok::<(), StorageError>(())
            });
        }
        while let Some(joined) = workers.join_next().await {
            joined.unwrap().unwrap();
        }

        let (n,): (i64,) = sqlx::query_as("SELECT n FROM counter WHERE id = 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(n, 100);
        pool.close().await;
    }
}

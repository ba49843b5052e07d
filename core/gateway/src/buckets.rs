//! SQLite-backed token buckets shared by every gateway on a host or volume.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use storegate_common::{Error, Result};

use crate::governor::{BucketState, BucketStore, VersionedBucket};

fn db_error(err: rusqlite::Error) -> Error {
    Error::Unavailable(format!("Bucket store: {}", err))
}

/// One row per rate-limit key, updated by compare-and-swap on `version`.
///
/// Queries run on the blocking pool; a busy database never parks a runtime
/// worker.
pub struct SqliteBucketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBucketStore {
    /// Create or open a bucket database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_error)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS rate_buckets (
                key TEXT PRIMARY KEY,
                tokens REAL NOT NULL,
                updated_ms INTEGER NOT NULL,
                paused_until_ms INTEGER NOT NULL,
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_error)?;

        info!(path = %db_path.as_ref().display(), "Bucket store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&conn).map_err(db_error)
        })
        .await
        .map_err(|e| Error::Unknown(format!("Bucket store task failed: {}", e)))?
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedBucket>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
                SELECT tokens, updated_ms, paused_until_ms, version
                FROM rate_buckets WHERE key = ?1
                "#,
                [&key],
                |row| {
                    Ok(VersionedBucket {
                        state: BucketState {
                            tokens: row.get(0)?,
                            updated_ms: row.get(1)?,
                            paused_until_ms: row.get(2)?,
                        },
                        version: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool> {
        let key = key.to_string();
        let changed = self
            .with_conn(move |conn| match expected {
                None => conn.execute(
                    r#"
                    INSERT INTO rate_buckets (key, tokens, updated_ms, paused_until_ms, version)
                    VALUES (?1, ?2, ?3, ?4, 1)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                    params![key, state.tokens, state.updated_ms, state.paused_until_ms],
                ),
                Some(version) => conn.execute(
                    r#"
                    UPDATE rate_buckets
                    SET tokens = ?2, updated_ms = ?3, paused_until_ms = ?4, version = version + 1
                    WHERE key = ?1 AND version = ?5
                    "#,
                    params![
                        key,
                        state.tokens,
                        state.updated_ms,
                        state.paused_until_ms,
                        version as i64
                    ],
                ),
            })
            .await?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{RateLimitBackend, SharedRateLimiter};
    use storegate_storage::RateQuota;

    fn state(tokens: f64) -> BucketState {
        BucketState {
            tokens,
            updated_ms: 1_000,
            paused_until_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_compare_and_swap_versions() {
        let store = SqliteBucketStore::in_memory().unwrap();
        assert!(store.load("a").await.unwrap().is_none());

        assert!(store.compare_and_swap("a", None, state(5.0)).await.unwrap());
        assert!(!store.compare_and_swap("a", None, state(4.0)).await.unwrap());

        let row = store.load("a").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.state.tokens, 5.0);

        assert!(store.compare_and_swap("a", Some(1), state(3.0)).await.unwrap());
        assert!(!store.compare_and_swap("a", Some(1), state(2.0)).await.unwrap());
        let row = store.load("a").await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.state.tokens, 3.0);
    }

    #[tokio::test]
    async fn test_locked_database_does_not_stall_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.db");
        let store = SqliteBucketStore::open(&path).unwrap();
        store.compare_and_swap("a", None, state(5.0)).await.unwrap();

        // Another process holds the write lock.
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let write = tokio::spawn(async move {
            store.compare_and_swap("a", Some(1), state(4.0)).await
        });
        // The current-thread runtime keeps running while the write waits.
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        holder.execute_batch("COMMIT;").unwrap();
        assert!(write.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_limiters_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.db");
        let first = SharedRateLimiter::new(Arc::new(SqliteBucketStore::open(&path).unwrap()));
        let second = SharedRateLimiter::new(Arc::new(SqliteBucketStore::open(&path).unwrap()));
        let quota = RateQuota {
            per_second: 0.001,
            burst: 2,
        };

        assert!(first.try_acquire("src", quota).await.unwrap().is_none());
        assert!(second.try_acquire("src", quota).await.unwrap().is_none());
        assert!(first.try_acquire("src", quota).await.unwrap().is_some());
        assert!(second.try_acquire("src", quota).await.unwrap().is_some());
    }
}

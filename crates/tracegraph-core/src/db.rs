//! Shared SQLite handle.
//!
//! One connection per store, guarded by a mutex; every call runs on the
//! blocking pool so async callers never hold the runtime while SQLite works.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{Result, StorageError};

#[derive(Clone)]
pub(crate) struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open (or create) a database file and apply `schema`.
    pub(crate) fn open(path: &Path, schema: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StorageError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(StorageError::from)?;
        conn.execute_batch(schema).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, for tests and throwaway pipelines.
    pub(crate) fn open_in_memory(schema: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        conn.execute_batch(schema).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("task join: {e}")))?;
        result.map_err(|e| StorageError::from(e).into())
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT NOT NULL);";

    #[tokio::test]
    async fn call_runs_on_blocking_pool() {
        let db = Db::open_in_memory(SCHEMA).unwrap();
        db.call(|conn| conn.execute("INSERT INTO kv (k, v) VALUES ('a', '1')", []))
            .await
            .unwrap();
        let v: String = db
            .call(|conn| conn.query_row("SELECT v FROM kv WHERE k = 'a'", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(v, "1");
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/tg.db");
        let db = Db::open(&path, SCHEMA).unwrap();
        let n: i64 = db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn sqlite_errors_map_to_storage_errors() {
        let db = Db::open_in_memory(SCHEMA).unwrap();
        let err = db
            .call(|conn| conn.execute("INSERT INTO missing (x) VALUES (1)", []))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::Database(_))
        ));
    }
}

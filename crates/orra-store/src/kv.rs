use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use orra_types::{OrraError, Result};

/// Transactional key-value store on SQLite. A single WAL connection behind an
/// async mutex; every multi-step update runs inside one SQL transaction via
/// [`KvStore::with_conn`].
#[derive(Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
}

fn store_err(err: rusqlite::Error) -> OrraError {
    OrraError::Store(err.to_string())
}

impl KvStore {
    /// Open (or create) the store at `{dir}/orra.db`.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let conn = Connection::open(dir.join("orra.db")).map_err(store_err)?;
        Self::init(conn)
    }

    /// Volatile store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )
        .map_err(store_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(store_err)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, raw],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(store_err)?;
        Ok(affected > 0)
    }

    /// All `(key, value)` pairs under a prefix, in key order. Keys are ASCII
    /// below `~`, so `prefix..prefix~` is an exact range scan.
    pub async fn list_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?1 || '~' ORDER BY key")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row.map_err(store_err)?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    pub async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key >= ?1 AND key < ?1 || '~'",
            params![prefix],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(store_err)
    }

    /// Run `f` against the connection inside one transaction. The closure
    /// either commits as a whole or leaves no trace.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(store_err)?;
        let out = f(&tx).map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(out)
    }
}

/// Transaction-scoped helpers for use inside [`KvStore::with_conn`].
pub(crate) fn tx_get_raw(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
) -> rusqlite::Result<Option<String>> {
    tx.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

pub(crate) fn tx_put_raw(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    value: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn tx_last_key(
    tx: &rusqlite::Transaction<'_>,
    prefix: &str,
) -> rusqlite::Result<Option<String>> {
    tx.query_row(
        "SELECT key FROM kv WHERE key >= ?1 AND key < ?1 || '~' ORDER BY key DESC LIMIT 1",
        params![prefix],
        |row| row.get(0),
    )
    .optional()
}

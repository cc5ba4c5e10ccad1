//! SQLite-backed [`RowStore`].
//!
//! Every store owns one table of `(key TEXT PRIMARY KEY, value TEXT)` rows
//! holding JSON-encoded keys and values. Several stores (in one process or
//! many) may open the same database file: `upsert_with` runs inside a
//! `BEGIN IMMEDIATE` transaction, so the read-modify-write of a row is
//! serialized across every connection to the file.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::RowStore;
use crate::{CedulaError, Result};

/// How long a writer waits for another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// [`RowStore`] on a SQLite table.
pub struct SqliteStore<K, V> {
    conn: Mutex<Connection>,
    table: String,
    _rows: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SqliteStore<K, V> {
    /// Open (or create) `path` and ensure `table` exists.
    ///
    /// The database runs in WAL mode so readers never block the writer.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CedulaError::Storage(format!(
                    "failed to create database dir {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        debug!(path = %path.display(), table, "opened sqlite store");
        Self::with_connection(conn, table)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory(table: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            _rows: PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Table names are interpolated into SQL, so only identifiers are allowed.
fn validate_table_name(table: &str) -> Result<()> {
    let valid = table
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CedulaError::Configuration(format!(
            "invalid table name '{table}'"
        )))
    }
}

impl<K, V> RowStore<K, V> for SqliteStore<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned + Clone,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        let key = serde_json::to_string(key)?;
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    fn upsert_with(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<V>) -> Option<V>,
    ) -> Result<Option<V>> {
        let key = serde_json::to_string(key)?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<V> = tx
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|v| serde_json::from_str(&v))
            .transpose()?;

        let result = match f(current.clone()) {
            Some(next) => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        self.table
                    ),
                    params![key, serde_json::to_string(&next)?],
                )?;
                Some(next)
            }
            None => current,
        };
        tx.commit()?;
        Ok(result)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        let key = serde_json::to_string(key)?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous: Option<String> = tx
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if previous.is_some() {
            tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table),
                params![key],
            )?;
        }
        tx.commit()?;
        Ok(previous.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    fn scan(&self) -> Result<Vec<(K, V)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {}", self.table))?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(k, v)| -> Result<(K, V)> {
                Ok((serde_json::from_str(&k)?, serde_json::from_str(&v)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_get_remove() {
        let store: SqliteStore<String, u32> = SqliteStore::open_in_memory("rows").unwrap();
        let key = "a".to_string();

        assert_eq!(store.upsert_with(&key, &mut |_| None).unwrap(), None);
        assert_eq!(
            store.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap(),
            Some(1)
        );
        assert_eq!(
            store.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap(),
            Some(2)
        );
        assert_eq!(store.upsert_with(&key, &mut |_| None).unwrap(), Some(2));
        assert_eq!(store.get(&key).unwrap(), Some(2));

        assert_eq!(store.remove(&key).unwrap(), Some(2));
        assert_eq!(store.remove(&key).unwrap(), None);
        assert!(store.scan().unwrap().is_empty());
    }

    #[test]
    fn structured_keys_scan_back() {
        let store: SqliteStore<(String, u8), Vec<String>> =
            SqliteStore::open_in_memory("pairs").unwrap();
        store
            .upsert_with(&("x".into(), 1), &mut |_| Some(vec!["one".into()]))
            .unwrap();
        store
            .upsert_with(&("x".into(), 2), &mut |_| Some(vec!["two".into()]))
            .unwrap();

        let mut rows = store.scan().unwrap();
        rows.sort();
        assert_eq!(
            rows,
            vec![
                (("x".to_string(), 1), vec!["one".to_string()]),
                (("x".to_string(), 2), vec!["two".to_string()]),
            ]
        );
    }

    #[test]
    fn rejects_unsafe_table_names() {
        for bad in ["", "1rows", "rows; DROP TABLE x", "a-b"] {
            let err = SqliteStore::<String, u32>::open_in_memory(bad).err();
            assert!(
                matches!(err, Some(CedulaError::Configuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn connections_to_one_file_share_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cedula.db");
        let a: SqliteStore<String, u64> = SqliteStore::open(&path, "counters").unwrap();
        let b: SqliteStore<String, u64> = SqliteStore::open(&path, "counters").unwrap();
        let key = "n".to_string();

        a.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap();
        b.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap();
        assert_eq!(a.get(&key).unwrap(), Some(2));
    }

    #[test]
    fn concurrent_writers_on_separate_connections_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cedula.db");
        // Create the table up front so writers never race on the schema.
        SqliteStore::<String, u64>::open(&path, "counters").unwrap();
        let key = "counter".to_string();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    let store: SqliteStore<String, u64> =
                        SqliteStore::open(&path, "counters").unwrap();
                    for _ in 0..50 {
                        store
                            .upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store: SqliteStore<String, u64> = SqliteStore::open(&path, "counters").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(200));
    }
}

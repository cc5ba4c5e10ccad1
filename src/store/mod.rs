//! Row-store persistence contract.
//!
//! Both shared mutable resources of the system (cache entries and the
//! rate-limiter bucket) live behind [`RowStore`]: a keyed store whose only
//! write primitive is an atomic read-modify-write of a single row. Any
//! backend that can serialize mutation per key (row lock, compare-and-swap)
//! satisfies it; contention is limited to the same key and never
//! serializes unrelated rows.
//!
//! [`MemoryStore`] is the bundled backend: a moka concurrent map (unbounded,
//! no TTL, so rows are never evicted behind the caller's back) whose
//! `and_compute_with` gives per-key atomicity. For single-host deployments
//! it can be persisted across restarts with [`MemoryStore::save_snapshot`]
//! and [`MemoryStore::load_snapshot`].
//!
//! [`SqliteStore`] keeps rows in a SQLite file instead, so every process
//! opening the same file shares one bucket and one cache. Select it with
//! [`StorageSettings::database_path`].

mod sqlite;

pub use sqlite::SqliteStore;

use std::hash::Hash;
use std::path::{Path, PathBuf};

use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CedulaError, Result};

/// Keyed storage with atomic single-row upserts.
pub trait RowStore<K, V>: Send + Sync {
    /// Read one row.
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Atomically read-modify-write one row.
    ///
    /// `f` receives the current row (if any). Returning `Some` stores the
    /// new value; returning `None` leaves the row untouched. Returns the
    /// row as it is after the operation. Concurrent calls for the same key
    /// are serialized; `f` runs exactly once per call.
    fn upsert_with(&self, key: &K, f: &mut dyn FnMut(Option<V>) -> Option<V>)
    -> Result<Option<V>>;

    /// Delete one row, returning it if it existed.
    fn remove(&self, key: &K) -> Result<Option<V>>;

    /// Snapshot of every row. Order is unspecified.
    fn scan(&self) -> Result<Vec<(K, V)>>;
}

/// Where shared rows live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database shared by every process using it. When unset, rows
    /// stay in process memory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Table holding cache entries in a shared database.
pub const CACHE_TABLE: &str = "cache_entries";

/// Table holding rate-limiter buckets in a shared database.
pub const LIMITER_TABLE: &str = "rate_limiter";

/// Maximum supported snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot<K, V> {
    version: u32,
    rows: Vec<(K, V)>,
}

/// In-process [`RowStore`] backed by a moka concurrent map.
pub struct MemoryStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    rows: Cache<K, V>,
}

impl<K, V> MemoryStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            rows: Cache::builder().build(),
        }
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.rows.iter().count()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for MemoryStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RowStore<K, V> for MemoryStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.rows.get(key))
    }

    fn upsert_with(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<V>) -> Option<V>,
    ) -> Result<Option<V>> {
        let result = self
            .rows
            .entry(key.clone())
            .and_compute_with(|current| match f(current.map(|e| e.into_value())) {
                Some(next) => Op::Put(next),
                None => Op::Nop,
            });
        Ok(match result {
            CompResult::Inserted(e) | CompResult::ReplacedWith(e) | CompResult::Unchanged(e) => {
                Some(e.into_value())
            }
            CompResult::Removed(_) | CompResult::StillNone(_) => None,
        })
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.rows.remove(key))
    }

    fn scan(&self) -> Result<Vec<(K, V)>> {
        Ok(self
            .rows
            .iter()
            .map(|(k, v)| (K::clone(&k), v))
            .collect())
    }
}

// ============================================================================
// Snapshot persistence
// ============================================================================

impl<K, V> MemoryStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Write every row to `path` (atomic write via tmp + rename).
    ///
    /// Returns the number of rows written.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CedulaError::Storage(format!(
                    "failed to create snapshot dir {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            rows: self.scan()?,
        };
        let count = snapshot.rows.len();
        let json = serde_json::to_string(&snapshot)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            CedulaError::Storage(format!(
                "failed to write snapshot {}: {e}",
                tmp_path.display()
            ))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            CedulaError::Storage(format!(
                "failed to rename snapshot {} → {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;

        debug!(path = %path.display(), rows = count, "saved store snapshot");
        Ok(count)
    }

    /// Load rows from a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// A missing file loads nothing. Loaded rows overwrite rows with the
    /// same key. Returns the number of rows loaded.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CedulaError::Storage(format!(
                    "failed to read snapshot {}: {e}",
                    path.display()
                )));
            }
        };

        let snapshot: Snapshot<K, V> = serde_json::from_str(&content).map_err(|e| {
            warn!(path = %path.display(), error = %e, "corrupt store snapshot");
            CedulaError::Storage(format!("corrupt snapshot {}: {e}", path.display()))
        })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(CedulaError::Storage(format!(
                "unsupported snapshot version {} (max supported: {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }

        let count = snapshot.rows.len();
        for (key, value) in snapshot.rows {
            self.rows.insert(key, value);
        }
        debug!(path = %path.display(), rows = count, "loaded store snapshot");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_inserts_then_replaces() {
        let store: MemoryStore<String, u32> = MemoryStore::new();
        let key = "a".to_string();

        let inserted = store.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap();
        assert_eq!(inserted, Some(1));

        let replaced = store.upsert_with(&key, &mut |cur| Some(cur.unwrap_or(0) + 1)).unwrap();
        assert_eq!(replaced, Some(2));
        assert_eq!(store.get(&key).unwrap(), Some(2));
    }

    #[test]
    fn upsert_returning_none_leaves_row_untouched() {
        let store: MemoryStore<String, u32> = MemoryStore::new();
        let key = "a".to_string();

        assert_eq!(store.upsert_with(&key, &mut |_| None).unwrap(), None);
        assert!(store.get(&key).unwrap().is_none());

        store.upsert_with(&key, &mut |_| Some(7)).unwrap();
        assert_eq!(store.upsert_with(&key, &mut |_| None).unwrap(), Some(7));
    }

    #[test]
    fn remove_returns_previous_row() {
        let store: MemoryStore<String, u32> = MemoryStore::new();
        let key = "a".to_string();
        store.upsert_with(&key, &mut |_| Some(3)).unwrap();

        assert_eq!(store.remove(&key).unwrap(), Some(3));
        assert_eq!(store.remove(&key).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_upserts_do_not_lose_updates() {
        let store = std::sync::Arc::new(MemoryStore::<String, u64>::new());
        let key = "counter".to_string();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
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

        assert_eq!(store.get(&key).unwrap(), Some(2_000));
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store: MemoryStore<String, u32> = MemoryStore::new();
        store.upsert_with(&"a".to_string(), &mut |_| Some(1)).unwrap();
        store.upsert_with(&"b".to_string(), &mut |_| Some(2)).unwrap();
        assert_eq!(store.save_snapshot(&path).unwrap(), 2);

        let restored: MemoryStore<String, u32> = MemoryStore::new();
        assert_eq!(restored.load_snapshot(&path).unwrap(), 2);
        assert_eq!(restored.get(&"b".to_string()).unwrap(), Some(2));
    }

    #[test]
    fn load_missing_snapshot_is_empty() {
        let store: MemoryStore<String, u32> = MemoryStore::new();
        let loaded = store
            .load_snapshot(Path::new("/nonexistent/path/store.json"))
            .unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn load_corrupt_snapshot_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();

        let store: MemoryStore<String, u32> = MemoryStore::new();
        assert!(store.load_snapshot(&path).is_err());
    }

    #[test]
    fn load_future_snapshot_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"version": 99, "rows": []}"#).unwrap();

        let store: MemoryStore<String, u32> = MemoryStore::new();
        let err = store.load_snapshot(&path).unwrap_err().to_string();
        assert!(err.contains("unsupported snapshot version"));
    }
}

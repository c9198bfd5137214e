//! Durable keyed snapshot store
//!
//! One JSON document per store, a map `key -> record`, loaded once at startup
//! and rewritten on every mutating event. The in-memory map is authoritative:
//! a failed save is logged and counted, and the next successful save catches
//! the file up.
//!
//! Mutation and persistence happen under the same `tokio::sync::Mutex`, so
//! concurrent upserts from different agents are serialized and a snapshot on
//! disk always contains every update committed before it.

use crate::error::PersistenceError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct DurableStore<V> {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, V>>,
    save_failures: AtomicU64,
}

impl<V> DurableStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send,
{
    /// Loads the snapshot at `path`. An absent, unreadable or structurally
    /// invalid file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_snapshot::<V>(&path).await {
            Ok(Some(entries)) => {
                info!(path = %path.display(), records = entries.len(), "snapshot loaded");
                entries
            }
            Ok(None) => {
                info!(path = %path.display(), "no existing snapshot, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot unusable, starting empty");
                BTreeMap::new()
            }
        };
        Self::with_entries(path, entries)
    }

    pub fn with_entries(path: impl Into<PathBuf>, entries: BTreeMap<String, V>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(entries),
            save_failures: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of saves that failed since startup.
    pub fn save_failures(&self) -> u64 {
        self.save_failures.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, V> {
        self.entries.lock().await.clone()
    }

    /// In-memory upsert, last write wins. Call `save` to persist.
    pub async fn merge(&self, key: impl Into<String>, value: V) {
        self.entries.lock().await.insert(key.into(), value);
    }

    /// Atomically rewrites the snapshot file with the current map.
    pub async fn save(&self) -> Result<(), PersistenceError> {
        let entries = self.entries.lock().await;
        self.persist(&entries).await
    }

    /// Upsert and persist in one critical section.
    pub async fn commit(&self, key: impl Into<String>, value: V) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.into(), value);
        self.persist(&entries).await
    }

    /// Mutates the record for `key`, creating it with `create` when absent,
    /// then persists. A failed save is logged; the mutation stands.
    pub async fn upsert<R>(
        &self,
        key: &str,
        create: impl FnOnce() -> V,
        mutate: impl FnOnce(&mut V, bool) -> R,
    ) -> R {
        let mut entries = self.entries.lock().await;
        let existed = entries.contains_key(key);
        let value = entries.entry(key.to_string()).or_insert_with(create);
        let result = mutate(value, existed);
        // logged and counted by persist
        let _ = self.persist(&entries).await;
        result
    }

    /// Mutates an existing record and persists. `None` when `key` is unknown.
    pub async fn update<R>(&self, key: &str, mutate: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entries = self.entries.lock().await;
        let result = mutate(entries.get_mut(key)?);
        // logged and counted by persist
        let _ = self.persist(&entries).await;
        Some(result)
    }

    /// Like `update`, but `mutate` reports whether it changed anything and
    /// the snapshot is rewritten only then. Returns that report.
    pub async fn update_if(&self, key: &str, mutate: impl FnOnce(&mut V) -> bool) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(value) = entries.get_mut(key) else {
            return false;
        };
        if !mutate(value) {
            return false;
        }
        // logged and counted by persist
        let _ = self.persist(&entries).await;
        true
    }

    async fn persist(&self, entries: &BTreeMap<String, V>) -> Result<(), PersistenceError> {
        let result = match serde_json::to_vec_pretty(entries) {
            Ok(bytes) => write_atomic(&self.path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(()) => debug!(path = %self.path.display(), records = entries.len(), "snapshot saved"),
            Err(e) => {
                self.save_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %self.path.display(), error = %e, "snapshot save failed, keeping in-memory state");
            }
        }
        result
    }
}

async fn read_snapshot<V: DeserializeOwned>(path: &Path) -> Result<Option<BTreeMap<String, V>>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Writes next to the target then renames, so readers never observe a
/// partially written snapshot.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::io(parent, e))?;
    }
    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| PersistenceError::io(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

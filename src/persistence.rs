//! Persisted mirror of the memoization caches.
//!
//! A [`PersistenceBridge`] keeps one JSON blob per cache namespace in a
//! [`StorageArea`]. The blob carries the time it was written; blobs older than
//! the staleness window are discarded on load. Writes are best-effort.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fjall::Keyspace;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

use crate::{Result, SkyglanceError};

/// Key -> string blob store with no transactional guarantees
#[async_trait]
pub trait StorageArea: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Session-scoped storage that lives as long as the process
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageArea for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.items.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Long-lived storage on disk, backed by a fjall keyspace
pub struct FjallStorage {
    store: Keyspace,
}

fn read_from_store(store: &Keyspace, key: &[u8]) -> Result<Option<String>> {
    match store.get(key)? {
        Some(bytes) => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| SkyglanceError::storage(format!("stored value is not UTF-8: {e}"))),
        None => Ok(None),
    }
}

fn join_error(err: task::JoinError) -> SkyglanceError {
    SkyglanceError::storage(format!("storage task failed: {err}"))
}

impl FjallStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = fjall::Database::builder(path.as_ref()).open()?;
        let store = db.keyspace("persisted_cache", fjall::KeyspaceCreateOptions::default)?;
        Ok(Self { store })
    }
}

#[async_trait]
impl StorageArea for FjallStorage {
    #[tracing::instrument(name = "storage_get", level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.store.clone();
        let key = key.as_bytes().to_vec();
        task::spawn_blocking(move || read_from_store(&store, &key))
            .await
            .map_err(join_error)?
    }

    #[tracing::instrument(name = "storage_set", level = "debug", skip(self, value))]
    async fn set(&self, key: &str, value: String) -> Result<()> {
        let store = self.store.clone();
        let key = key.as_bytes().to_vec();
        task::spawn_blocking(move || store.insert(key, value.into_bytes()))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let store = self.store.clone();
        let key = key.as_bytes().to_vec();
        task::spawn_blocking(move || store.remove(key))
            .await
            .map_err(join_error)??;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct PersistedEntry<V> {
    value: V,
    /// Unix timestamp (milliseconds)
    saved_at: i64,
}

#[derive(Serialize, Deserialize)]
struct PersistedBlob<V> {
    #[serde(rename = "_timestamp")]
    timestamp: i64,
    entries: HashMap<String, PersistedEntry<V>>,
}

impl<V> PersistedEntry<V> {
    fn is_fresh(&self, now: i64, ttl: ChronoDuration) -> bool {
        now - self.saved_at < ttl.num_milliseconds()
    }
}

/// Secondary cache layer mirrored to a storage area.
///
/// Only entries younger than the entry TTL are kept, in memory and on disk.
pub struct PersistenceBridge<V> {
    storage: Arc<dyn StorageArea>,
    blob_key: String,
    entry_ttl: ChronoDuration,
    entries: Mutex<HashMap<String, PersistedEntry<V>>>,
    /// Held from snapshot to completed write so blobs land in order
    writer: tokio::sync::Mutex<()>,
}

impl<V> PersistenceBridge<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Load the blob stored under `blob_key`, discarding it when it is older
    /// than `staleness` or cannot be parsed.
    pub async fn load(
        storage: Arc<dyn StorageArea>,
        blob_key: impl Into<String>,
        entry_ttl: Duration,
        staleness: Duration,
    ) -> Self {
        let blob_key = blob_key.into();
        let entry_ttl = ChronoDuration::milliseconds(millis(entry_ttl));
        let now = Utc::now().timestamp_millis();
        let entries = match storage.get(&blob_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedBlob<V>>(&raw) {
                Ok(blob) if now - blob.timestamp < millis(staleness) => {
                    let stored = blob.entries.len();
                    let mut entries = blob.entries;
                    entries.retain(|_, entry| entry.is_fresh(now, entry_ttl));
                    tracing::debug!(
                        blob = %blob_key,
                        entries = entries.len(),
                        expired = stored - entries.len(),
                        "loaded persisted cache"
                    );
                    entries
                }
                Ok(_) => {
                    tracing::info!(blob = %blob_key, "persisted cache is stale, discarding");
                    discard(storage.as_ref(), &blob_key).await;
                    HashMap::new()
                }
                Err(e) => {
                    tracing::warn!(blob = %blob_key, error = %e, "persisted cache is corrupt, discarding");
                    discard(storage.as_ref(), &blob_key).await;
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!(blob = %blob_key, error = %e, "failed to read persisted cache");
                HashMap::new()
            }
        };

        Self {
            storage,
            blob_key,
            entry_ttl,
            entries: Mutex::new(entries),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Fresh value for `key`; stale entries are dropped from memory and
    /// disappear from storage with the next write.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(key)
            .map(|entry| entry.is_fresh(Utc::now().timestamp_millis(), self.entry_ttl))?;
        if fresh {
            entries.get(key).map(|entry| entry.value.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.entries.lock().insert(
            key.into(),
            PersistedEntry {
                value,
                saved_at: Utc::now().timestamp_millis(),
            },
        );
        self.flush().await;
    }

    pub async fn remove(&self, key: &str) {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.flush().await;
        }
    }

    pub async fn clear(&self) {
        let _writer = self.writer.lock().await;
        self.entries.lock().clear();
        discard(self.storage.as_ref(), &self.blob_key).await;
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn flush(&self) {
        let _writer = self.writer.lock().await;
        let serialized = {
            let now = Utc::now().timestamp_millis();
            let mut entries = self.entries.lock();
            entries.retain(|_, entry| entry.is_fresh(now, self.entry_ttl));
            serde_json::to_string(&PersistedBlob {
                timestamp: now,
                entries: entries.clone(),
            })
        };

        let result = match serialized {
            Ok(raw) => self.storage.set(&self.blob_key, raw).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(blob = %self.blob_key, error = %e, "failed to persist cache");
        }
    }
}

async fn discard(storage: &dyn StorageArea, key: &str) {
    if let Err(e) = storage.remove(key).await {
        tracing::warn!(blob = %key, error = %e, "failed to remove persisted cache");
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

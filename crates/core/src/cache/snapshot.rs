//! Cross-restart persistence of cache entries through an external key/value store.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{CacheInsert, ResponseCache};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key/value backend error: {0}")]
    Backend(String),
    #[error("could not encode or decode `{key}`: {message}")]
    Codec { key: String, message: String },
}

/// Minimal get/set/TTL contract a persistence backend must honor.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Makes earlier writes durable. Stores that write through need not override this.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryKeyValueStore {
    values: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.read().await;
        let now = Instant::now();
        Ok(values
            .get(key)
            .filter(|(_, expires_at)| expires_at.map(|at| now < at).unwrap_or(true))
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), (value, ttl.map(|ttl| Instant::now() + ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut values = self.values.write().await;
        Ok(values.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let values = self.values.read().await;
        let now = Instant::now();
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(key, (_, expires_at))| {
                key.starts_with(prefix) && expires_at.map(|at| now < at).unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// Store kept as one JSON document on disk, so a snapshot survives the process.
/// Expiry is wall-clock; writes stay in memory until [`flush`](KeyValueStore::flush).
pub struct FileKeyValueStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, FileEntry>>,
}

impl FileKeyValueStore {
    /// A store that ignores whatever is already at `path` and replaces it on flush.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), values: RwLock::new(BTreeMap::new()) }
    }

    /// Loads `path`; a missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|error| StoreError::Codec {
                key: path.display().to_string(),
                message: error.to_string(),
            })?,
            Err(error) if error.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                return Err(StoreError::Backend(format!(
                    "could not read {}: {error}",
                    path.display()
                )))
            }
        };
        Ok(Self { path, values: RwLock::new(values) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.read().await;
        let now = Utc::now();
        Ok(values.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|error| StoreError::Backend(error.to_string()))?,
            ),
            None => None,
        };
        let mut values = self.values.write().await;
        values.insert(key.to_string(), FileEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut values = self.values.write().await;
        Ok(values.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let values = self.values.read().await;
        let now = Utc::now();
        Ok(values
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let encoded = {
            let values = self.values.read().await;
            let now = Utc::now();
            let live: BTreeMap<&String, &FileEntry> =
                values.iter().filter(|(_, entry)| entry.is_live(now)).collect();
            serde_json::to_vec_pretty(&live).map_err(|error| StoreError::Codec {
                key: self.path.display().to_string(),
                message: error.to_string(),
            })?
        };

        let backend = |error: std::io::Error| {
            StoreError::Backend(format!("could not write {}: {error}", self.path.display()))
        };
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(backend)?;
        }
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, encoded).await.map_err(backend)?;
        tokio::fs::rename(&staging, &self.path).await.map_err(backend)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord<V> {
    key: String,
    value: V,
    expires_at: DateTime<Utc>,
    hit_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub expired: usize,
    pub skipped: usize,
}

impl<V> ResponseCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Writes every live entry to `store` under `prefix`, with its remaining lifetime as
    /// the store TTL. Returns the number of entries written.
    pub async fn persist(
        &self,
        store: &dyn KeyValueStore,
        prefix: &str,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let entries = self.snapshot_entries();
        let count = entries.len();

        for entry in entries {
            let expires_at = now
                + chrono::Duration::from_std(entry.remaining)
                    .map_err(|error| StoreError::Backend(error.to_string()))?;
            let record = SnapshotRecord {
                key: entry.key.clone(),
                value: entry.value,
                expires_at,
                hit_count: entry.hit_count,
            };
            let encoded = serde_json::to_string(&record).map_err(|error| StoreError::Codec {
                key: entry.key.clone(),
                message: error.to_string(),
            })?;
            store.set(&format!("{prefix}{}", entry.key), encoded, Some(entry.remaining)).await?;
        }
        store.flush().await?;

        info!(event_name = "cache.snapshot.persisted", entries = count, prefix, "cache persisted");
        Ok(count)
    }

    /// Loads entries written by [`persist`](Self::persist). Records whose absolute expiry
    /// has passed are dropped; unreadable records are skipped and logged.
    pub async fn restore(
        &self,
        store: &dyn KeyValueStore,
        prefix: &str,
    ) -> Result<RestoreReport, StoreError> {
        let mut report = RestoreReport::default();
        let now = Utc::now();

        for store_key in store.keys(prefix).await? {
            let Some(raw) = store.get(&store_key).await? else {
                report.expired += 1;
                continue;
            };
            let record: SnapshotRecord<V> = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(error) => {
                    report.skipped += 1;
                    warn!(
                        event_name = "cache.snapshot.unreadable",
                        key = %store_key,
                        error = %error,
                        "skipping unreadable cache snapshot record"
                    );
                    continue;
                }
            };

            let remaining = match (record.expires_at - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    report.expired += 1;
                    continue;
                }
            };

            match self.set(&record.key, record.value, Some(remaining)) {
                Ok(CacheInsert::Stored { .. }) => report.restored += 1,
                Ok(CacheInsert::Rejected { .. }) | Err(_) => report.skipped += 1,
            }
        }

        info!(
            event_name = "cache.snapshot.restored",
            restored = report.restored,
            expired = report.expired,
            skipped = report.skipped,
            "cache restored from snapshot"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore};
    use crate::cache::ResponseCache;

    fn cache() -> ResponseCache<String> {
        ResponseCache::with_limits(10, 10_000, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn persist_then_restore_carries_live_entries() -> Result<(), String> {
        let store = InMemoryKeyValueStore::default();
        let source = cache();
        source.set("GET /a", "alpha".to_string(), None).map_err(|err| err.to_string())?;
        source
            .set("GET /b", "beta".to_string(), Some(Duration::from_secs(60)))
            .map_err(|err| err.to_string())?;

        let written =
            source.persist(&store, "sluice:cache:").await.map_err(|err| err.to_string())?;
        assert_eq!(written, 2);

        let target = cache();
        let report =
            target.restore(&store, "sluice:cache:").await.map_err(|err| err.to_string())?;
        assert_eq!(report.restored, 2);
        assert_eq!(target.get("GET /a"), Some("alpha".to_string()));
        assert_eq!(target.get("GET /b"), Some("beta".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_records_are_skipped() -> Result<(), String> {
        let store = InMemoryKeyValueStore::default();
        store
            .set("sluice:cache:bad", "{not json".to_string(), None)
            .await
            .map_err(|err| err.to_string())?;

        let report =
            cache().restore(&store, "sluice:cache:").await.map_err(|err| err.to_string())?;
        assert_eq!(report.restored, 0);
        assert_eq!(report.skipped, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn store_honors_ttl() -> Result<(), String> {
        let store = InMemoryKeyValueStore::default();
        store
            .set("k", "v".to_string(), Some(Duration::from_secs(1)))
            .await
            .map_err(|err| err.to_string())?;
        assert_eq!(store.get("k").await.map_err(|err| err.to_string())?, Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.map_err(|err| err.to_string())?, None);
        assert!(store.keys("").await.map_err(|err| err.to_string())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn file_store_survives_a_reopen() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err| err.to_string())?;
        let path = dir.path().join("nested").join("cache.json");
        let source = cache();
        source.set("GET /a", "alpha".to_string(), None).map_err(|err| err.to_string())?;

        let written = source
            .persist(&FileKeyValueStore::empty(&path), "sluice:cache:")
            .await
            .map_err(|err| err.to_string())?;
        assert_eq!(written, 1);
        assert!(path.exists());

        let reopened = FileKeyValueStore::open(&path).await.map_err(|err| err.to_string())?;
        let target = cache();
        let report =
            target.restore(&reopened, "sluice:cache:").await.map_err(|err| err.to_string())?;
        assert_eq!(report.restored, 1);
        assert_eq!(target.get("GET /a"), Some("alpha".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_opens_empty_and_corrupt_file_is_an_error() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err| err.to_string())?;
        let missing = FileKeyValueStore::open(dir.path().join("absent.json"))
            .await
            .map_err(|err| err.to_string())?;
        assert!(missing.keys("").await.map_err(|err| err.to_string())?.is_empty());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").map_err(|err| err.to_string())?;
        assert!(FileKeyValueStore::open(&corrupt).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn expired_file_entries_are_not_served_or_flushed() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err| err.to_string())?;
        let path = dir.path().join("cache.json");
        let store = FileKeyValueStore::empty(&path);
        store
            .set("gone", "v".to_string(), Some(Duration::ZERO))
            .await
            .map_err(|err| err.to_string())?;
        store.set("kept", "v".to_string(), None).await.map_err(|err| err.to_string())?;

        assert_eq!(store.get("gone").await.map_err(|err| err.to_string())?, None);
        store.flush().await.map_err(|err| err.to_string())?;

        let reopened = FileKeyValueStore::open(&path).await.map_err(|err| err.to_string())?;
        assert_eq!(reopened.keys("").await.map_err(|err| err.to_string())?, vec!["kept"]);
        Ok(())
    }
}

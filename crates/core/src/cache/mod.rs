//! TTL and memory-bounded response cache with popularity tracking.
//!
//! Entry sizes are estimated from their JSON serialization. All bookkeeping (entries,
//! memory usage, counters) sits behind one mutex so `memory_usage_bytes` always equals the
//! sum of resident entry sizes.

pub mod policy;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::errors::{CacheError, OriginError};

pub use policy::{CachePolicy, CacheRule};
pub use snapshot::{
    FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore, RestoreReport, StoreError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheInsert {
    Stored { size: usize, evicted: usize },
    Rejected { size: usize, limit: usize },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub memory_usage_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejected: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PopularKey {
    pub key: String,
    pub hits: u64,
    pub resident: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub requested: usize,
    pub warmed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Computes values for cache warming, out of band from client requests.
#[async_trait]
pub trait WarmProducer<V>: Send + Sync {
    async fn produce(&self, key: &str) -> Result<V, OriginError>;
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
    size_bytes: usize,
    hit_count: u64,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.stored_at + self.ttl
    }

    fn score(&self, now: Instant) -> f64 {
        let idle_secs = now.saturating_duration_since(self.last_access).as_secs_f64();
        (self.hit_count as f64 + 1.0) / (1.0 + idle_secs)
    }
}

/// Resident entry exported for snapshots.
pub(crate) struct SnapshotEntry<V> {
    pub key: String,
    pub value: V,
    pub remaining: Duration,
    pub hit_count: u64,
}

pub struct ResponseCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct CacheInner<V> {
    max_entries: usize,
    max_memory_bytes: usize,
    default_ttl: Duration,
    state: Mutex<CacheState<V>>,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    popularity: HashMap<String, u64>,
    memory_usage: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejected: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.memory_usage = self.memory_usage.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn lowest_score(&self, now: Instant) -> Option<String> {
        self.entries
            .iter()
            .min_by(|(_, left), (_, right)| {
                left.score(now)
                    .total_cmp(&right.score(now))
                    .then_with(|| left.last_access.cmp(&right.last_access))
            })
            .map(|(key, _)| key.clone())
    }

    fn record_hit(&mut self, key: &str, max_tracked: usize) {
        *self.popularity.entry(key.to_string()).or_default() += 1;
        if self.popularity.len() > max_tracked.saturating_mul(2) {
            let mut ranked: Vec<(String, u64)> = self.popularity.drain().collect();
            ranked.sort_by(|left, right| right.1.cmp(&left.1));
            ranked.truncate(max_tracked);
            self.popularity = ranked.into_iter().collect();
        }
    }
}

impl<V> CacheInner<V> {
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_entries, config.max_memory_bytes(), config.default_ttl())
    }

    pub fn with_limits(max_entries: usize, max_memory_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                max_entries: max_entries.max(1),
                max_memory_bytes,
                default_ttl,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    popularity: HashMap::new(),
                    memory_usage: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    expirations: 0,
                    rejected: 0,
                }),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.lock();

        let live = match state.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.hit_count += 1;
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                state.misses += 1;
                return None;
            }
        };

        match live {
            Some(value) => {
                state.hits += 1;
                state.record_hit(key, self.inner.max_entries);
                Some(value)
            }
            None => {
                state.remove(key);
                state.expirations += 1;
                state.misses += 1;
                None
            }
        }
    }

    /// Inserts `value`, evicting the lowest-scoring entries until both ceilings hold.
    /// An entry that alone exceeds the memory ceiling is rejected and nothing is evicted.
    pub fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<CacheInsert, CacheError> {
        let size = estimate_size(key, &value)?;
        let limit = self.inner.max_memory_bytes;
        if size > limit {
            let mut state = self.inner.lock();
            state.rejected += 1;
            warn!(
                event_name = "cache.insert.rejected",
                key,
                size,
                limit,
                "entry exceeds cache memory ceiling on its own"
            );
            return Ok(CacheInsert::Rejected { size, limit });
        }

        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        let mut state = self.inner.lock();
        state.remove(key);

        let over_budget = |state: &CacheState<V>| {
            state.entries.len() + 1 > self.inner.max_entries || state.memory_usage + size > limit
        };

        if over_budget(&*state) {
            state.purge_expired(now);
        }

        let mut evicted = 0;
        while over_budget(&*state) {
            let Some(victim) = state.lowest_score(now) else {
                break;
            };
            if let Some(entry) = state.remove(&victim) {
                evicted += 1;
                debug!(
                    event_name = "cache.evicted",
                    key = %victim,
                    size = entry.size_bytes,
                    hits = entry.hit_count,
                    "cache entry evicted"
                );
            }
        }
        state.evictions += evicted as u64;

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                size_bytes: size,
                hit_count: 0,
                last_access: now,
            },
        );
        state.memory_usage += size;

        Ok(CacheInsert::Stored { size, evicted })
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.inner.lock();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let cleared = state.entries.len();
        state.entries.clear();
        state.memory_usage = 0;
        info!(event_name = "cache.cleared", cleared, "response cache cleared");
        cleared
    }

    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.lock().purge_expired(Instant::now());
        if purged > 0 {
            debug!(event_name = "cache.purged", purged, "expired cache entries purged");
        }
        purged
    }

    /// Most-hit keys first, including keys that are no longer resident.
    pub fn popular(&self, limit: usize) -> Vec<PopularKey> {
        let now = Instant::now();
        let state = self.inner.lock();
        let mut ranked: Vec<PopularKey> = state
            .popularity
            .iter()
            .map(|(key, hits)| PopularKey {
                key: key.clone(),
                hits: *hits,
                resident: state.entries.get(key).map(|entry| entry.is_live(now)).unwrap_or(false),
            })
            .collect();
        ranked.sort_by(|left, right| {
            right.hits.cmp(&left.hits).then_with(|| left.key.cmp(&right.key))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Computes and inserts values for `keys` on a background task. Keys already resident
    /// are skipped; producer failures are counted and logged.
    pub fn warm(
        &self,
        keys: Vec<String>,
        ttl: Option<Duration>,
        producer: Arc<dyn WarmProducer<V>>,
    ) -> JoinHandle<WarmReport> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut report = WarmReport { requested: keys.len(), ..WarmReport::default() };
            for key in keys {
                if cache.contains(&key) {
                    report.skipped += 1;
                    continue;
                }
                match producer.produce(&key).await {
                    Ok(value) => match cache.set(&key, value, ttl) {
                        Ok(CacheInsert::Stored { .. }) => report.warmed += 1,
                        Ok(CacheInsert::Rejected { .. }) | Err(_) => report.failed += 1,
                    },
                    Err(error) => {
                        report.failed += 1;
                        warn!(
                            event_name = "cache.warm.failed",
                            key = %key,
                            error = %error,
                            "cache warming producer failed"
                        );
                    }
                }
            }
            info!(
                event_name = "cache.warm.completed",
                requested = report.requested,
                warmed = report.warmed,
                skipped = report.skipped,
                failed = report.failed,
                "cache warming finished"
            );
            report
        })
    }

    pub fn warm_popular(
        &self,
        limit: usize,
        ttl: Option<Duration>,
        producer: Arc<dyn WarmProducer<V>>,
    ) -> JoinHandle<WarmReport> {
        let keys = self.popular(limit).into_iter().map(|popular| popular.key).collect();
        self.warm(keys, ttl, producer)
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner.lock().entries.get(key).map(|entry| entry.is_live(now)).unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.inner.max_entries,
            memory_usage_bytes: state.memory_usage,
            max_memory_bytes: self.inner.max_memory_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 { 0.0 } else { state.hits as f64 / lookups as f64 },
            evictions: state.evictions,
            expirations: state.expirations,
            rejected: state.rejected,
        }
    }

    pub(crate) fn snapshot_entries(&self) -> Vec<SnapshotEntry<V>> {
        let now = Instant::now();
        let state = self.inner.lock();
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                remaining: (entry.stored_at + entry.ttl).saturating_duration_since(now),
                hit_count: entry.hit_count,
            })
            .collect()
    }
}

fn estimate_size<V: Serialize>(key: &str, value: &V) -> Result<usize, CacheError> {
    let encoded = serde_json::to_vec(value).map_err(|error| CacheError::Serialize {
        key: key.to_string(),
        message: error.to_string(),
    })?;
    Ok(encoded.len() + key.len())
}

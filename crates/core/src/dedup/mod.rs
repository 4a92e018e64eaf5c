//! Collapses concurrent identical requests onto a single origin call.
//!
//! The first caller for a key becomes the leader and runs the origin call on its own task.
//! Later callers subscribe to the same result cell. A successful result stays visible for
//! `dedup_ttl` after it settles so late duplicates are answered without a new call; a
//! failure is dropped from the table as soon as every current waiter has seen it.

pub mod batch;
pub mod fingerprint;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::errors::OriginError;

pub use batch::{ActiveBatch, BatchCoordinator, BatchFetcher, BatchSettings, BatchStats};
pub use fingerprint::{RequestBody, RequestDescriptor};

type Settled<V> = Option<Result<V, OriginError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightRole {
    Leader,
    Follower,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DuplicateDetail {
    pub key: String,
    pub flight_id: u64,
    pub waiters: usize,
    pub age_ms: u64,
    pub settled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub in_flight: usize,
    pub recently_settled: usize,
    pub origin_calls: u64,
    pub duplicates_saved: u64,
    #[serde(flatten)]
    pub batches: BatchStats,
}

pub struct DeduplicationBatcher<V> {
    inner: Arc<DedupInner<V>>,
}

impl<V> Clone for DeduplicationBatcher<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct DedupInner<V> {
    dedup_ttl: Duration,
    state: Mutex<DedupState<V>>,
    batches: BatchCoordinator<V>,
}

struct DedupState<V> {
    entries: HashMap<String, InFlightEntry<V>>,
    next_flight: u64,
    origin_calls: u64,
    duplicates_saved: u64,
}

struct InFlightEntry<V> {
    flight_id: u64,
    cell: watch::Receiver<Settled<V>>,
    started_at: Instant,
    settled_at: Option<Instant>,
    waiters: usize,
}

impl<V> InFlightEntry<V> {
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        self.settled_at.map(|settled_at| settled_at + ttl <= now).unwrap_or(false)
    }
}

impl<V> DedupState<V> {
    fn owns(&self, key: &str, flight_id: u64) -> bool {
        self.entries.get(key).map(|entry| entry.flight_id) == Some(flight_id)
    }
}

impl<V> DedupInner<V> {
    fn lock(&self) -> MutexGuard<'_, DedupState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Owned by the leader's task. Publishes the result, or clears the entry if the task ends
/// without one.
struct Flight<V> {
    inner: Arc<DedupInner<V>>,
    key: String,
    flight_id: u64,
    tx: Option<watch::Sender<Settled<V>>>,
}

impl<V> Flight<V> {
    fn settle(mut self, result: Result<V, OriginError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let mut state = self.inner.lock();
        let failed = result.is_err();
        tx.send_replace(Some(result));

        if !state.owns(&self.key, self.flight_id) {
            return;
        }
        if failed {
            state.entries.remove(&self.key);
        } else if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.settled_at = Some(Instant::now());
        }
    }
}

impl<V> Drop for Flight<V> {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        let mut state = self.inner.lock();
        if state.owns(&self.key, self.flight_id) {
            state.entries.remove(&self.key);
        }
    }
}

impl<V> DeduplicationBatcher<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                dedup_ttl: config.dedup_ttl(),
                state: Mutex::new(DedupState {
                    entries: HashMap::new(),
                    next_flight: 0,
                    origin_calls: 0,
                    duplicates_saved: 0,
                }),
                batches: BatchCoordinator::new(BatchSettings::from(config)),
            }),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, fetcher: F) -> Result<V, OriginError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, OriginError>> + Send + 'static,
    {
        self.run_with_role(key, fetcher).await.1
    }

    /// Like [`run`](Self::run) but also reports whether this caller issued the origin call.
    ///
    /// `fetcher` is only invoked by the leader. The returned future runs on its own task,
    /// so a caller that goes away never cancels the shared call.
    pub async fn run_with_role<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
    ) -> (FlightRole, Result<V, OriginError>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, OriginError>> + Send + 'static,
    {
        let now = Instant::now();
        let (role, mut cell, leader) = {
            let mut state = self.inner.lock();
            let stale =
                state.entries.get(key).map(|entry| entry.expired(now, self.inner.dedup_ttl));
            if stale == Some(true) {
                state.entries.remove(key);
            }

            if let Some(entry) = state.entries.get_mut(key) {
                entry.waiters += 1;
                let cell = entry.cell.clone();
                let flight_id = entry.flight_id;
                state.duplicates_saved += 1;
                debug!(
                    event_name = "dedup.duplicate.joined",
                    key,
                    flight_id,
                    "duplicate request joined in-flight call"
                );
                (FlightRole::Follower, cell, None)
            } else {
                let (tx, cell) = watch::channel(None);
                let flight_id = state.next_flight;
                state.next_flight += 1;
                state.origin_calls += 1;
                state.entries.insert(
                    key.to_string(),
                    InFlightEntry {
                        flight_id,
                        cell: cell.clone(),
                        started_at: now,
                        settled_at: None,
                        waiters: 1,
                    },
                );
                let flight = Flight {
                    inner: self.inner.clone(),
                    key: key.to_string(),
                    flight_id,
                    tx: Some(tx),
                };
                (FlightRole::Leader, cell, Some(flight))
            }
        };

        if let Some(flight) = leader {
            let call = fetcher();
            tokio::spawn(async move {
                let result = call.await;
                if let Err(error) = &result {
                    warn!(
                        event_name = "dedup.origin.failed",
                        key = %flight.key,
                        flight_id = flight.flight_id,
                        error = %error,
                        "origin call failed; error shared with all waiters"
                    );
                }
                flight.settle(result);
            });
        }

        let settled = match cell.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        let result = settled
            .unwrap_or_else(|| Err(OriginError::new("origin task ended without a result")));
        (role, result)
    }

    /// Leader path for batchable endpoint classes: the deduplicated call joins the batch
    /// window for `group` instead of going to the origin alone.
    pub async fn run_batched(
        &self,
        key: &str,
        group: &str,
        descriptor: RequestDescriptor,
        fetcher: Arc<dyn BatchFetcher<V>>,
    ) -> (FlightRole, Result<V, OriginError>) {
        let batches = self.inner.batches.clone();
        let group = group.to_string();
        self.run_with_role(key, move || async move {
            batches.submit(&group, descriptor, fetcher).await
        })
        .await
    }

    pub fn flush(&self) -> usize {
        self.inner.batches.flush()
    }

    /// Forgets settled results and resets counters. In-flight calls are kept so the
    /// one-call-per-key guarantee holds across a clear.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.inner.lock();
            let before = state.entries.len();
            state.entries.retain(|_, entry| entry.settled_at.is_none());
            state.origin_calls = 0;
            state.duplicates_saved = 0;
            before - state.entries.len()
        };
        self.inner.batches.reset_stats();
        info!(event_name = "dedup.cleared", removed, "deduplication table cleared");
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.inner.dedup_ttl;
        let mut state = self.inner.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.expired(now, ttl));
        let purged = before - state.entries.len();
        if purged > 0 {
            debug!(event_name = "dedup.purged", purged, "expired settled entries purged");
        }
        purged
    }

    pub fn active_batches(&self) -> Vec<ActiveBatch> {
        self.inner.batches.active_batches()
    }

    pub fn duplicate_details(&self) -> Vec<DuplicateDetail> {
        let now = Instant::now();
        let state = self.inner.lock();
        let mut details: Vec<DuplicateDetail> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.expired(now, self.inner.dedup_ttl))
            .map(|(key, entry)| DuplicateDetail {
                key: key.clone(),
                flight_id: entry.flight_id,
                waiters: entry.waiters,
                age_ms: now.saturating_duration_since(entry.started_at).as_millis() as u64,
                settled: entry.settled_at.is_some(),
            })
            .collect();
        details.sort_by_key(|detail| detail.flight_id);
        details
    }

    pub fn stats(&self) -> DedupStats {
        let now = Instant::now();
        let batches = self.inner.batches.stats();
        let state = self.inner.lock();
        let ttl = self.inner.dedup_ttl;
        let live = state.entries.values().filter(|entry| !entry.expired(now, ttl));
        let (in_flight, recently_settled) = live.fold((0, 0), |(open, settled), entry| {
            if entry.settled_at.is_some() {
                (open, settled + 1)
            } else {
                (open + 1, settled)
            }
        });
        DedupStats {
            in_flight,
            recently_settled,
            origin_calls: state.origin_calls,
            duplicates_saved: state.duplicates_saved,
            batches,
        }
    }
}

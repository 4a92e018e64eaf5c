//! Batch windows: compatible requests that arrive close together share one combined
//! origin call.
//!
//! A window closes at the earliest of three triggers: it reaches `batch_size` members, no
//! member joined for `batch_timeout`, or `max_batch_wait` passed since it opened. Results of
//! the combined call are handed back to members in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::dedup::fingerprint::RequestDescriptor;
use crate::errors::OriginError;

#[async_trait]
pub trait BatchFetcher<V>: Send + Sync {
    /// Issues one combined call. Must return exactly one result per request, in order.
    async fn fetch_batch(&self, requests: Vec<RequestDescriptor>) -> Result<Vec<V>, OriginError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_batch_wait: Duration,
}

impl From<&DedupConfig> for BatchSettings {
    fn from(config: &DedupConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            max_batch_wait: config.max_batch_wait(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveBatch {
    pub group: String,
    pub window_id: u64,
    pub members: usize,
    pub age_ms: u64,
    pub closes_in_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub active_batches: usize,
    pub total_batches: u64,
    pub average_batch_size: f64,
    pub average_batch_wait_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseTrigger {
    Size,
    Idle,
    MaxWait,
    Flush,
}

impl CloseTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Idle => "idle",
            Self::MaxWait => "max_wait",
            Self::Flush => "flush",
        }
    }
}

pub struct BatchCoordinator<V> {
    inner: Arc<BatchInner<V>>,
}

impl<V> Clone for BatchCoordinator<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct BatchInner<V> {
    settings: BatchSettings,
    state: Mutex<BatchState<V>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct BatchState<V> {
    windows: HashMap<String, OpenWindow<V>>,
    next_window: u64,
    total_batches: u64,
    total_members: u64,
    total_wait_ms: u64,
}

struct OpenWindow<V> {
    id: u64,
    opened_at: Instant,
    last_join: Instant,
    members: Vec<Member<V>>,
    fetcher: Arc<dyn BatchFetcher<V>>,
}

struct Member<V> {
    descriptor: RequestDescriptor,
    tx: oneshot::Sender<Result<V, OriginError>>,
}

impl<V> OpenWindow<V> {
    fn deadline(&self, settings: &BatchSettings) -> (Instant, CloseTrigger) {
        let idle = self.last_join + settings.batch_timeout;
        let hard = self.opened_at + settings.max_batch_wait;
        if hard <= idle {
            (hard, CloseTrigger::MaxWait)
        } else {
            (idle, CloseTrigger::Idle)
        }
    }
}

impl<V: Send + 'static> BatchCoordinator<V> {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                settings,
                state: Mutex::new(BatchState {
                    windows: HashMap::new(),
                    next_window: 0,
                    total_batches: 0,
                    total_members: 0,
                    total_wait_ms: 0,
                }),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Joins (or opens) the window for `group` and waits for this member's share of the
    /// combined result.
    pub async fn submit(
        &self,
        group: &str,
        descriptor: RequestDescriptor,
        fetcher: Arc<dyn BatchFetcher<V>>,
    ) -> Result<V, OriginError> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let settings = self.inner.settings;

        let full = {
            let mut state = self.inner.lock_state();
            let opened = !state.windows.contains_key(group);
            let next_id = state.next_window;
            let window = state.windows.entry(group.to_string()).or_insert_with(|| OpenWindow {
                id: next_id,
                opened_at: now,
                last_join: now,
                members: Vec::new(),
                fetcher,
            });
            window.members.push(Member { descriptor, tx });
            window.last_join = now;
            let window_id = window.id;
            let members = window.members.len();
            if opened {
                state.next_window += 1;
                debug!(event_name = "dedup.batch.opened", group, window_id, "batch window opened");
                self.spawn_timer(group.to_string(), window_id);
            }

            if members >= settings.batch_size {
                state.windows.remove(group).map(|window| self.close(&mut state, group, window))
            } else {
                None
            }
        };

        if let Some(job) = full {
            self.dispatch(group.to_string(), job, CloseTrigger::Size);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(OriginError::new("batch window was dropped before dispatch")),
        }
    }

    /// Closes every open window immediately. Returns how many windows were dispatched.
    pub fn flush(&self) -> usize {
        let jobs: Vec<(String, ClosedWindow<V>)> = {
            let mut state = self.inner.lock_state();
            let groups: Vec<String> = state.windows.keys().cloned().collect();
            groups
                .into_iter()
                .filter_map(|group| {
                    let window = state.windows.remove(&group)?;
                    let job = self.close(&mut state, &group, window);
                    Some((group, job))
                })
                .collect()
        };

        let count = jobs.len();
        for (group, job) in jobs {
            self.dispatch(group, job, CloseTrigger::Flush);
        }
        if count > 0 {
            info!(
                event_name = "dedup.batch.flushed",
                windows = count,
                "open batch windows flushed"
            );
        }
        count
    }

    pub fn active_batches(&self) -> Vec<ActiveBatch> {
        let now = Instant::now();
        let state = self.inner.lock_state();
        let mut batches: Vec<ActiveBatch> = state
            .windows
            .iter()
            .map(|(group, window)| {
                let (deadline, _) = window.deadline(&self.inner.settings);
                ActiveBatch {
                    group: group.clone(),
                    window_id: window.id,
                    members: window.members.len(),
                    age_ms: now.saturating_duration_since(window.opened_at).as_millis() as u64,
                    closes_in_ms: deadline.saturating_duration_since(now).as_millis() as u64,
                }
            })
            .collect();
        batches.sort_by_key(|batch| batch.window_id);
        batches
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.inner.lock_state();
        let (average_batch_size, average_batch_wait_ms) = if state.total_batches == 0 {
            (0.0, 0.0)
        } else {
            let batches = state.total_batches as f64;
            (state.total_members as f64 / batches, state.total_wait_ms as f64 / batches)
        };
        BatchStats {
            active_batches: state.windows.len(),
            total_batches: state.total_batches,
            average_batch_size,
            average_batch_wait_ms,
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.inner.lock_state();
        state.total_batches = 0;
        state.total_members = 0;
        state.total_wait_ms = 0;
    }

    fn close(
        &self,
        state: &mut BatchState<V>,
        group: &str,
        window: OpenWindow<V>,
    ) -> ClosedWindow<V> {
        let waited = window.opened_at.elapsed();
        state.total_batches += 1;
        state.total_members += window.members.len() as u64;
        state.total_wait_ms += waited.as_millis() as u64;
        debug!(
            event_name = "dedup.batch.closing",
            group,
            window_id = window.id,
            members = window.members.len(),
            waited_ms = waited.as_millis() as u64,
            "batch window closing"
        );
        ClosedWindow { id: window.id, members: window.members, fetcher: window.fetcher }
    }

    fn spawn_timer(&self, group: String, window_id: u64) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = coordinator.inner.lock_state();
                    match state.windows.get(&group) {
                        Some(window) if window.id == window_id => {
                            window.deadline(&coordinator.inner.settings)
                        }
                        _ => return,
                    }
                };

                sleep_until(deadline.0).await;

                let job = {
                    let mut state = coordinator.inner.lock_state();
                    let due = match state.windows.get(&group) {
                        Some(window) if window.id == window_id => {
                            let (current, trigger) = window.deadline(&coordinator.inner.settings);
                            (current <= Instant::now()).then_some(trigger)
                        }
                        _ => return,
                    };
                    match due {
                        Some(trigger) => state
                            .windows
                            .remove(&group)
                            .map(|window| (coordinator.close(&mut state, &group, window), trigger)),
                        None => None,
                    }
                };

                if let Some((job, trigger)) = job {
                    coordinator.dispatch(group, job, trigger);
                    return;
                }
            }
        });
    }

    fn dispatch(&self, group: String, job: ClosedWindow<V>, trigger: CloseTrigger) {
        let gate = self.inner.gate(&group);
        tokio::spawn(async move {
            let _serialized = gate.lock().await;
            let ClosedWindow { id, members, fetcher } = job;
            let (descriptors, senders): (Vec<_>, Vec<_>) =
                members.into_iter().map(|member| (member.descriptor, member.tx)).unzip();
            let expected = descriptors.len();

            info!(
                event_name = "dedup.batch.closed",
                group = %group,
                window_id = id,
                members = expected,
                trigger = trigger.as_str(),
                "dispatching combined origin call"
            );

            match fetcher.fetch_batch(descriptors).await {
                Ok(values) if values.len() == expected => {
                    for (tx, value) in senders.into_iter().zip(values) {
                        let _ = tx.send(Ok(value));
                    }
                }
                Ok(values) => {
                    let error = OriginError::new(format!(
                        "batch response carried {} results for {expected} requests",
                        values.len()
                    ));
                    warn!(
                        event_name = "dedup.batch.mismatch",
                        group = %group,
                        window_id = id,
                        expected,
                        received = values.len(),
                        "combined call returned the wrong number of results"
                    );
                    for tx in senders {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
                Err(error) => {
                    warn!(
                        event_name = "dedup.batch.failed",
                        group = %group,
                        window_id = id,
                        error = %error,
                        "combined origin call failed"
                    );
                    for tx in senders {
                        let _ = tx.send(Err(error.clone()));
                    }
                }
            }
        });
    }
}

struct ClosedWindow<V> {
    id: u64,
    members: Vec<Member<V>>,
    fetcher: Arc<dyn BatchFetcher<V>>,
}

impl<V> BatchInner<V> {
    fn lock_state(&self) -> MutexGuard<'_, BatchState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn gate(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.entry(group.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, Instant};

    use super::{BatchCoordinator, BatchFetcher, BatchSettings};
    use crate::dedup::fingerprint::RequestDescriptor;
    use crate::errors::OriginError;

    #[derive(Default)]
    struct ScriptedBatchFetcher {
        calls: Mutex<Vec<(Instant, Vec<String>)>>,
        fail_with: Option<OriginError>,
        drop_last: bool,
    }

    #[async_trait]
    impl BatchFetcher<String> for ScriptedBatchFetcher {
        async fn fetch_batch(
            &self,
            requests: Vec<RequestDescriptor>,
        ) -> Result<Vec<String>, OriginError> {
            let paths: Vec<String> = requests.iter().map(|request| request.path.clone()).collect();
            self.calls.lock().await.push((Instant::now(), paths.clone()));
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            let mut values: Vec<String> =
                paths.into_iter().map(|path| format!("ok:{path}")).collect();
            if self.drop_last {
                values.pop();
            }
            Ok(values)
        }
    }

    fn settings(batch_size: usize, batch_timeout_ms: u64, max_batch_wait_ms: u64) -> BatchSettings {
        BatchSettings {
            batch_size,
            batch_timeout: Duration::from_millis(batch_timeout_ms),
            max_batch_wait: Duration::from_millis(max_batch_wait_ms),
        }
    }

    fn spawn_member(
        coordinator: &BatchCoordinator<String>,
        fetcher: &Arc<ScriptedBatchFetcher>,
        path: &str,
    ) -> tokio::task::JoinHandle<Result<String, OriginError>> {
        let coordinator = coordinator.clone();
        let fetcher: Arc<dyn BatchFetcher<String>> = fetcher.clone();
        let descriptor = RequestDescriptor::new("POST", path);
        tokio::spawn(async move { coordinator.submit("embeddings", descriptor, fetcher).await })
    }

    #[tokio::test(start_paused = true)]
    async fn window_closes_on_size_with_one_call_in_arrival_order() {
        let coordinator = BatchCoordinator::new(settings(3, 50, 2_000));
        let fetcher = Arc::new(ScriptedBatchFetcher::default());

        let first = spawn_member(&coordinator, &fetcher, "/a");
        tokio::task::yield_now().await;
        let second = spawn_member(&coordinator, &fetcher, "/b");
        tokio::task::yield_now().await;
        let third = spawn_member(&coordinator, &fetcher, "/c");

        assert_eq!(first.await.expect("join"), Ok("ok:/a".to_string()));
        assert_eq!(second.await.expect("join"), Ok("ok:/b".to_string()));
        assert_eq!(third.await.expect("join"), Ok("ok:/c".to_string()));

        let calls = fetcher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["/a", "/b", "/c"]);
        assert_eq!(coordinator.stats().total_batches, 1);
        assert_eq!(coordinator.stats().average_batch_size, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_closes_after_idle_timeout() {
        let coordinator = BatchCoordinator::new(settings(10, 50, 2_000));
        let fetcher = Arc::new(ScriptedBatchFetcher::default());
        let started = Instant::now();

        let first = spawn_member(&coordinator, &fetcher, "/a");
        let second = spawn_member(&coordinator, &fetcher, "/b");

        assert!(first.await.expect("join").is_ok());
        assert!(second.await.expect("join").is_ok());

        let calls = fetcher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        let closed_after = calls[0].0 - started;
        assert!(closed_after >= Duration::from_millis(50));
        assert!(closed_after < Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_closes_at_max_wait_even_with_steady_joins() {
        let coordinator = BatchCoordinator::new(settings(100, 50, 100));
        let fetcher = Arc::new(ScriptedBatchFetcher::default());
        let started = Instant::now();

        let producer = tokio::spawn({
            let coordinator = coordinator.clone();
            let fetcher = fetcher.clone();
            async move {
                let mut members = Vec::new();
                for index in 0..6 {
                    members.push(spawn_member(&coordinator, &fetcher, &format!("/m{index}")));
                    sleep(Duration::from_millis(40)).await;
                }
                members
            }
        });

        for member in producer.await.expect("producer should finish") {
            assert!(member.await.expect("join").is_ok());
        }

        let calls = fetcher.calls.lock().await;
        assert_eq!(calls.len(), 2, "max wait splits the stream into two windows");
        assert_eq!(calls[0].1, vec!["/m0", "/m1", "/m2"]);
        assert_eq!(calls[1].1, vec!["/m3", "/m4", "/m5"]);
        let first_close = calls[0].0 - started;
        assert!(first_close >= Duration::from_millis(100));
        assert!(first_close < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn combined_failure_reaches_every_member() {
        let coordinator = BatchCoordinator::new(settings(2, 50, 2_000));
        let fetcher = Arc::new(ScriptedBatchFetcher {
            fail_with: Some(OriginError::with_status(429, "rate limited")),
            ..ScriptedBatchFetcher::default()
        });

        let first = spawn_member(&coordinator, &fetcher, "/a");
        let second = spawn_member(&coordinator, &fetcher, "/b");

        let expected = Err(OriginError::with_status(429, "rate limited"));
        assert_eq!(first.await.expect("join"), expected);
        assert_eq!(second.await.expect("join"), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn short_result_list_fails_the_whole_window() {
        let coordinator = BatchCoordinator::new(settings(2, 50, 2_000));
        let fetcher =
            Arc::new(ScriptedBatchFetcher { drop_last: true, ..ScriptedBatchFetcher::default() });

        let first = spawn_member(&coordinator, &fetcher, "/a");
        let second = spawn_member(&coordinator, &fetcher, "/b");

        assert!(first.await.expect("join").is_err());
        assert!(second.await.expect("join").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_closes_open_windows_immediately() {
        let coordinator = BatchCoordinator::new(settings(10, 1_000, 2_000));
        let fetcher = Arc::new(ScriptedBatchFetcher::default());
        let started = Instant::now();

        let member = spawn_member(&coordinator, &fetcher, "/a");
        tokio::task::yield_now().await;
        assert_eq!(coordinator.active_batches().len(), 1);
        assert_eq!(coordinator.active_batches()[0].members, 1);

        assert_eq!(coordinator.flush(), 1);
        assert!(member.await.expect("join").is_ok());
        assert!(coordinator.active_batches().is_empty());
        assert_eq!(fetcher.calls.lock().await[0].0, started);
    }
}

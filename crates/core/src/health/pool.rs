//! Fixed-size worker pool with one-at-a-time replacement.
//!
//! Each slot moves through Draining, Stopped and Replaced. Only one slot is ever out of
//! service, so a pool of two or more keeps serving throughout a rolling restart. A slot
//! that fails to restart is logged and skipped; the remaining slots are still replaced.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not spawn worker for slot {slot}: {message}")]
    Spawn { slot: usize, message: String },
    #[error("worker {slot} control channel failed: {message}")]
    Control { slot: usize, message: String },
    #[error("worker {slot} did not report ready within {timeout_ms}ms")]
    ReadyTimeout { slot: usize, timeout_ms: u64 },
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait WorkerHandle: Send {
    fn slot(&self) -> usize;
    fn pid(&self) -> Option<u32>;
    /// Asks the worker to stop admitting requests and exit once idle.
    async fn drain(&mut self) -> Result<(), PoolError>;
    /// Waits up to `timeout` for the worker to exit. `Ok(false)` means it is still running.
    async fn wait_exit(&mut self, timeout: Duration) -> Result<bool, PoolError>;
    async fn terminate(&mut self) -> Result<(), PoolError>;
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), PoolError>;
    /// Non-blocking check used by the pool monitor.
    fn has_exited(&mut self) -> bool;
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, slot: usize) -> Result<Box<dyn WorkerHandle>, PoolError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStage {
    Draining,
    Stopped,
    Replaced,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotFailure {
    pub slot: usize,
    pub stage: RestartStage,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RollingRestartReport {
    pub replaced: Vec<usize>,
    pub forced: Vec<usize>,
    pub failures: Vec<SlotFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub slot: usize,
    pub pid: Option<u32>,
    pub running: bool,
}

pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    size: usize,
    grace: Duration,
    ready_timeout: Duration,
    slots: Mutex<Vec<Option<Box<dyn WorkerHandle>>>>,
    /// `(slot, pid)` of workers taking traffic; a draining worker is already gone from here.
    live: StdMutex<Vec<(usize, u32)>>,
}

impl WorkerPool {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        size: usize,
        grace: Duration,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            spawner,
            size,
            grace,
            ready_timeout,
            slots: Mutex::new((0..size).map(|_| None).collect()),
            live: StdMutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawns every slot and waits for each to report ready.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut slots = self.slots.lock().await;
        for slot in 0..self.size {
            let mut worker = self.spawner.spawn(slot).await?;
            worker.wait_ready(self.ready_timeout).await?;
            info!(
                event_name = "health.pool.worker.ready",
                slot,
                pid = worker.pid(),
                "worker ready"
            );
            slots[slot] = Some(worker);
        }
        self.refresh_pids(&slots);
        Ok(())
    }

    pub async fn rolling_restart(&self, reason: &str) -> RollingRestartReport {
        let mut report = RollingRestartReport::default();
        info!(
            event_name = "health.pool.restart.started",
            reason,
            workers = self.size,
            "rolling restart started"
        );

        for slot in 0..self.size {
            let mut slots = self.slots.lock().await;
            let old = slots[slot].take();
            self.refresh_pids(&slots);
            if let Some(mut old) = old {
                self.retire(slot, &mut *old, &mut report).await;
            }

            match self.replace(slot).await {
                Ok(worker) => {
                    slots[slot] = Some(worker);
                    report.replaced.push(slot);
                    info!(
                        event_name = "health.pool.slot.replaced",
                        slot,
                        stage = "replaced",
                        "worker replaced"
                    );
                }
                Err((worker, failure)) => {
                    slots[slot] = worker;
                    error!(
                        event_name = "health.pool.slot.failed",
                        slot,
                        error = %failure.message,
                        "worker replacement failed; continuing with next slot"
                    );
                    report.failures.push(failure);
                }
            }
            self.refresh_pids(&slots);
        }

        info!(
            event_name = "health.pool.restart.completed",
            replaced = report.replaced.len(),
            failures = report.failures.len(),
            "rolling restart completed"
        );
        report
    }

    /// Replaces workers that exited on their own. Returns the slots that were respawned.
    pub async fn respawn_exited(&self) -> Vec<usize> {
        let mut respawned = Vec::new();
        let mut slots = self.slots.lock().await;
        for slot in 0..self.size {
            let exited = slots[slot].as_mut().map(|worker| worker.has_exited()).unwrap_or(true);
            if !exited {
                continue;
            }
            warn!(event_name = "health.pool.worker.exited", slot, "worker exited; respawning");
            match self.replace(slot).await {
                Ok(worker) => {
                    slots[slot] = Some(worker);
                    respawned.push(slot);
                }
                Err((worker, failure)) => {
                    slots[slot] = worker;
                    error!(
                        event_name = "health.pool.slot.failed",
                        slot,
                        error = %failure.message,
                        "worker respawn failed"
                    );
                }
            }
        }
        self.refresh_pids(&slots);
        respawned
    }

    pub async fn shutdown(&self) {
        let mut slots = self.slots.lock().await;
        let mut report = RollingRestartReport::default();
        for slot in 0..self.size {
            let worker = slots[slot].take();
            self.refresh_pids(&slots);
            if let Some(mut worker) = worker {
                self.retire(slot, &mut *worker, &mut report).await;
            }
        }
        info!(
            event_name = "health.pool.shutdown",
            forced = report.forced.len(),
            "worker pool stopped"
        );
    }

    pub async fn status(&self) -> Vec<WorkerStatus> {
        let mut slots = self.slots.lock().await;
        slots
            .iter_mut()
            .enumerate()
            .map(|(slot, worker)| match worker {
                Some(worker) => WorkerStatus {
                    slot,
                    pid: worker.pid(),
                    running: !worker.has_exited(),
                },
                None => WorkerStatus { slot, pid: None, running: false },
            })
            .collect()
    }

    /// Current worker process ids, readable without awaiting.
    pub fn pids(&self) -> Vec<u32> {
        self.live_workers().into_iter().map(|(_, pid)| pid).collect()
    }

    /// Slots whose worker is taking traffic, in slot order.
    pub fn serving_slots(&self) -> Vec<usize> {
        self.live_workers().into_iter().map(|(slot, _)| slot).collect()
    }

    fn live_workers(&self) -> Vec<(usize, u32)> {
        match self.live.lock() {
            Ok(live) => live.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn retire(
        &self,
        slot: usize,
        worker: &mut dyn WorkerHandle,
        report: &mut RollingRestartReport,
    ) {
        info!(
            event_name = "health.pool.slot.draining",
            slot,
            stage = "draining",
            "draining worker"
        );
        if let Err(error) = worker.drain().await {
            warn!(
                event_name = "health.pool.slot.drain_failed",
                slot,
                error = %error,
                "drain request failed; worker will be terminated"
            );
        }

        let exited = match worker.wait_exit(self.grace).await {
            Ok(exited) => exited,
            Err(error) => {
                warn!(
                    event_name = "health.pool.slot.wait_failed",
                    slot,
                    error = %error,
                    "waiting for worker exit failed"
                );
                false
            }
        };

        if !exited {
            report.forced.push(slot);
            warn!(
                event_name = "health.pool.slot.forced",
                slot,
                grace_ms = self.grace.as_millis() as u64,
                "worker did not exit within grace period; terminating"
            );
            if let Err(error) = worker.terminate().await {
                report.failures.push(SlotFailure {
                    slot,
                    stage: RestartStage::Stopped,
                    message: error.to_string(),
                });
            }
        }
        info!(event_name = "health.pool.slot.stopped", slot, stage = "stopped", "worker stopped");
    }

    async fn replace(
        &self,
        slot: usize,
    ) -> Result<Box<dyn WorkerHandle>, (Option<Box<dyn WorkerHandle>>, SlotFailure)> {
        let mut worker = self.spawner.spawn(slot).await.map_err(|error| {
            (None, SlotFailure { slot, stage: RestartStage::Replaced, message: error.to_string() })
        })?;

        match worker.wait_ready(self.ready_timeout).await {
            Ok(()) => Ok(worker),
            Err(error) => Err((
                Some(worker),
                SlotFailure { slot, stage: RestartStage::Replaced, message: error.to_string() },
            )),
        }
    }

    fn refresh_pids(&self, slots: &[Option<Box<dyn WorkerHandle>>]) {
        let current: Vec<(usize, u32)> = slots
            .iter()
            .enumerate()
            .filter_map(|(slot, worker)| {
                worker.as_ref().and_then(|worker| worker.pid()).map(|pid| (slot, pid))
            })
            .collect();
        match self.live.lock() {
            Ok(mut live) => *live = current,
            Err(poisoned) => *poisoned.into_inner() = current,
        }
    }
}

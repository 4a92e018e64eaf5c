//! Process watchdog: samples vitals on a timer and decides when to restart.
//!
//! Memory and CPU breaches need a streak of consecutive over-threshold samples; an error
//! rate above the per-minute threshold restarts right away. Every restart, automatic or
//! forced, passes the same cooldown and budget gate.

pub mod pool;
pub mod sampler;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::config::HealthConfig;
use crate::errors::RestartSuppressed;

pub use pool::{
    PoolError, RestartStage, RollingRestartReport, SlotFailure, WorkerHandle, WorkerPool,
    WorkerSpawner, WorkerStatus,
};
pub use sampler::{ErrorTracker, PidSource, ProcessSampler, ProcessVitals, VitalsSampler};

const RESTART_HISTORY_LIMIT: usize = 20;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub rss_bytes: u64,
    pub heap_used_bytes: u64,
    pub cpu_percent: f32,
    pub error_count: usize,
    pub active_requests: usize,
    pub queue_length: usize,
    pub cache_entries: usize,
    pub cache_memory_bytes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Healthy,
    RestartPending,
    Restarting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Restarting,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartReason {
    Memory,
    Cpu,
    ErrorRate,
    Manual { reason: String },
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory threshold exceeded"),
            Self::Cpu => write!(f, "cpu threshold exceeded"),
            Self::ErrorRate => write!(f, "error rate threshold exceeded"),
            Self::Manual { reason } => write!(f, "manual: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestartRecord {
    pub reason: RestartReason,
    pub triggered_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub attempt_count: u32,
}

/// Load figures the supervisor folds into each sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub active_requests: usize,
    pub queue_length: usize,
    pub cache_entries: usize,
    pub cache_memory_bytes: usize,
}

pub trait LoadProbe: Send + Sync {
    fn load(&self) -> LoadSnapshot;
}

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("restart failed: {0}")]
    Failed(String),
}

/// Carries out a restart once the supervisor has decided on one.
#[async_trait]
pub trait RestartExecutor: Send + Sync {
    async fn restart(&self, reason: &RestartReason) -> Result<(), RestartError>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleReport {
    pub sample: HealthSample,
    pub breach: Option<RestartReason>,
    pub restart: Option<Result<RestartRecord, RestartSuppressed>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthStats {
    pub status: HealthStatus,
    pub state: SupervisorState,
    pub enabled: bool,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub auto_restart_enabled: bool,
    pub cooldown_remaining_ms: u64,
    pub memory_streak: usize,
    pub cpu_streak: usize,
    pub memory_threshold_bytes: u64,
    pub cpu_threshold_percent: f32,
    pub error_threshold_per_minute: u32,
    pub last_sample: Option<HealthSample>,
    pub restarts: Vec<RestartRecord>,
}

struct Bookkeeping {
    samples: VecDeque<HealthSample>,
    state: SupervisorState,
    restart_count: u32,
    last_restart: Option<Instant>,
    history: VecDeque<RestartRecord>,
}

pub struct HealthSupervisor {
    config: HealthConfig,
    sampler: Mutex<Box<dyn VitalsSampler>>,
    errors: ErrorTracker,
    probe: Option<Arc<dyn LoadProbe>>,
    executor: Arc<dyn RestartExecutor>,
    book: Mutex<Bookkeeping>,
}

impl HealthSupervisor {
    pub fn new(
        config: &HealthConfig,
        sampler: Box<dyn VitalsSampler>,
        executor: Arc<dyn RestartExecutor>,
    ) -> Self {
        Self {
            config: config.clone(),
            sampler: Mutex::new(sampler),
            errors: ErrorTracker::default(),
            probe: None,
            executor,
            book: Mutex::new(Bookkeeping {
                samples: VecDeque::with_capacity(config.sample_window),
                state: SupervisorState::Healthy,
                restart_count: 0,
                last_restart: None,
                history: VecDeque::new(),
            }),
        }
    }

    /// Shares an error tracker with the request path so failures feed the error rate.
    pub fn with_error_tracker(mut self, errors: ErrorTracker) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn error_tracker(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    /// Takes one sample, records it in the rolling window and restarts on a breach.
    pub async fn sample(&self) -> SampleReport {
        let vitals = {
            let mut sampler = match self.sampler.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sampler.sample()
        };
        let vitals = vitals.unwrap_or_else(|| {
            warn!(event_name = "health.sample.unavailable", "process vitals unavailable");
            ProcessVitals::default()
        });
        let load = self.probe.as_ref().map(|probe| probe.load()).unwrap_or_default();

        let sample = HealthSample {
            timestamp: Utc::now(),
            rss_bytes: vitals.rss_bytes,
            heap_used_bytes: vitals.heap_used_bytes,
            cpu_percent: vitals.cpu_percent,
            error_count: self.errors.recent(),
            active_requests: load.active_requests,
            queue_length: load.queue_length,
            cache_entries: load.cache_entries,
            cache_memory_bytes: load.cache_memory_bytes,
        };

        let breach = {
            let mut book = self.lock_book();
            book.samples.push_back(sample.clone());
            while book.samples.len() > self.config.sample_window.max(1) {
                book.samples.pop_front();
            }
            self.detect_breach(&book.samples)
        };

        debug!(
            event_name = "health.sample.recorded",
            rss_bytes = sample.rss_bytes,
            cpu_percent = sample.cpu_percent,
            error_count = sample.error_count,
            active_requests = sample.active_requests,
            queue_length = sample.queue_length,
            "health sample recorded"
        );

        let restart = match &breach {
            Some(reason) => {
                warn!(
                    event_name = "health.breach.detected",
                    reason = %reason,
                    rss_bytes = sample.rss_bytes,
                    cpu_percent = sample.cpu_percent,
                    error_count = sample.error_count,
                    "health threshold breached"
                );
                Some(self.restart(reason.clone()).await)
            }
            None => None,
        };

        SampleReport { sample, breach, restart }
    }

    /// Restarts without waiting for a breach. Cooldown and budget still apply.
    pub async fn force_restart(
        &self,
        reason: impl Into<String>,
    ) -> Result<RestartRecord, RestartSuppressed> {
        self.restart(RestartReason::Manual { reason: reason.into() }).await
    }

    /// Same gate as [`force_restart`](Self::force_restart), but the restart itself runs
    /// on its own task so the caller gets the decision immediately.
    pub fn spawn_force_restart(
        self: &Arc<Self>,
        reason: impl Into<String>,
    ) -> Result<RestartRecord, RestartSuppressed> {
        let record = self.reserve(RestartReason::Manual { reason: reason.into() })?;
        let supervisor = self.clone();
        let pending = record.clone();
        tokio::spawn(async move { supervisor.execute(&pending).await });
        Ok(record)
    }

    /// Re-enables automatic restarts; returns the count that was cleared.
    pub fn reset_restart_count(&self) -> u32 {
        let previous = {
            let mut book = self.lock_book();
            std::mem::replace(&mut book.restart_count, 0)
        };
        info!(event_name = "health.restart.budget_reset", previous, "restart count reset");
        previous
    }

    pub fn stats(&self) -> HealthStats {
        let book = self.lock_book();
        let last_sample = book.samples.back().cloned();
        let over_threshold = last_sample
            .as_ref()
            .map(|sample| {
                self.memory_over(sample)
                    || self.cpu_over(sample)
                    || sample.error_count > self.config.error_threshold_per_minute as usize
            })
            .unwrap_or(false);
        let auto_restart_enabled = book.restart_count < self.config.max_restarts;

        let status = match book.state {
            SupervisorState::Restarting | SupervisorState::RestartPending => {
                HealthStatus::Restarting
            }
            SupervisorState::Healthy if over_threshold || !auto_restart_enabled => {
                HealthStatus::Degraded
            }
            SupervisorState::Healthy => HealthStatus::Healthy,
        };

        HealthStats {
            status,
            state: book.state,
            enabled: self.config.enabled,
            restart_count: book.restart_count,
            max_restarts: self.config.max_restarts,
            auto_restart_enabled,
            cooldown_remaining_ms: self.cooldown_remaining(&book).as_millis() as u64,
            memory_streak: trailing(&book.samples, |sample| self.memory_over(sample)),
            cpu_streak: trailing(&book.samples, |sample| self.cpu_over(sample)),
            memory_threshold_bytes: self.config.memory_threshold_bytes,
            cpu_threshold_percent: self.config.cpu_threshold_percent,
            error_threshold_per_minute: self.config.error_threshold_per_minute,
            last_sample,
            restarts: book.history.iter().cloned().collect(),
        }
    }

    /// Runs the sampling loop until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!(event_name = "health.loop.disabled", "health supervision disabled");
                return;
            }
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(
                event_name = "health.loop.started",
                interval_ms = self.config.health_check_interval_ms,
                "health supervision started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sample().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(event_name = "health.loop.stopped", "health supervision stopped");
        })
    }

    async fn restart(&self, reason: RestartReason) -> Result<RestartRecord, RestartSuppressed> {
        let record = self.reserve(reason)?;
        self.execute(&record).await;
        Ok(record)
    }

    fn reserve(&self, reason: RestartReason) -> Result<RestartRecord, RestartSuppressed> {
        let decision = {
            let mut book = self.lock_book();
            if book.state != SupervisorState::Healthy {
                Err(RestartSuppressed::InProgress)
            } else if book.restart_count >= self.config.max_restarts {
                Err(RestartSuppressed::BudgetExhausted { max_restarts: self.config.max_restarts })
            } else {
                let remaining = self.cooldown_remaining(&book);
                if !remaining.is_zero() {
                    Err(RestartSuppressed::Cooldown { remaining_ms: remaining.as_millis() as u64 })
                } else {
                    let triggered_at = Utc::now();
                    book.restart_count += 1;
                    book.last_restart = Some(Instant::now());
                    book.state = SupervisorState::RestartPending;
                    book.samples.clear();
                    let record = RestartRecord {
                        reason: reason.clone(),
                        triggered_at,
                        cooldown_until: triggered_at
                            + chrono::Duration::milliseconds(
                                self.config.restart_cooldown_ms as i64,
                            ),
                        attempt_count: book.restart_count,
                    };
                    book.history.push_back(record.clone());
                    while book.history.len() > RESTART_HISTORY_LIMIT {
                        book.history.pop_front();
                    }
                    Ok(record)
                }
            }
        };

        match &decision {
            Ok(record) => warn!(
                event_name = "health.restart.triggered",
                reason = %record.reason,
                attempt = record.attempt_count,
                max_restarts = self.config.max_restarts,
                "restart triggered"
            ),
            Err(suppressed) => warn!(
                event_name = "health.restart.suppressed",
                reason = %reason,
                suppressed = %suppressed,
                "restart suppressed"
            ),
        }
        decision
    }

    async fn execute(&self, record: &RestartRecord) {
        self.lock_book().state = SupervisorState::Restarting;
        match self.executor.restart(&record.reason).await {
            Ok(()) => info!(
                event_name = "health.restart.completed",
                reason = %record.reason,
                attempt = record.attempt_count,
                "restart completed"
            ),
            Err(err) => error!(
                event_name = "health.restart.failed",
                reason = %record.reason,
                error = %err,
                "restart failed"
            ),
        }
        self.lock_book().state = SupervisorState::Healthy;
    }

    fn detect_breach(&self, samples: &VecDeque<HealthSample>) -> Option<RestartReason> {
        let latest = samples.back()?;
        if latest.error_count > self.config.error_threshold_per_minute as usize {
            return Some(RestartReason::ErrorRate);
        }
        let memory_streak = trailing(samples, |sample| self.memory_over(sample));
        if memory_streak >= self.config.memory_breach_samples {
            return Some(RestartReason::Memory);
        }
        let cpu_streak = trailing(samples, |sample| self.cpu_over(sample));
        if cpu_streak >= self.config.cpu_breach_samples {
            return Some(RestartReason::Cpu);
        }
        None
    }

    fn memory_over(&self, sample: &HealthSample) -> bool {
        sample.rss_bytes > self.config.memory_threshold_bytes
    }

    fn cpu_over(&self, sample: &HealthSample) -> bool {
        sample.cpu_percent > self.config.cpu_threshold_percent
    }

    fn cooldown_remaining(&self, book: &Bookkeeping) -> Duration {
        book.last_restart
            .map(|at| self.config.cooldown().saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn lock_book(&self) -> MutexGuard<'_, Bookkeeping> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn trailing(samples: &VecDeque<HealthSample>, over: impl Fn(&HealthSample) -> bool) -> usize {
    samples.iter().rev().take_while(|sample| over(sample)).count()
}

/// Restart for a process that serves traffic itself: stop admitting, let in-flight work
/// finish within the grace period, then signal shutdown so the process can exit.
pub struct DrainingRestart {
    admission: AdmissionController,
    grace: Duration,
    shutdown: watch::Sender<bool>,
}

impl DrainingRestart {
    pub fn new(
        admission: AdmissionController,
        grace: Duration,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self { admission, grace, shutdown }
    }
}

#[async_trait]
impl RestartExecutor for DrainingRestart {
    async fn restart(&self, reason: &RestartReason) -> Result<(), RestartError> {
        let drained = self.admission.drain(self.grace).await;
        if !drained {
            warn!(
                event_name = "health.restart.drain_incomplete",
                reason = %reason,
                grace_ms = self.grace.as_millis() as u64,
                active_requests = self.admission.stats().active_requests,
                "grace period elapsed with requests still active"
            );
        }
        self.shutdown.send_replace(true);
        Ok(())
    }
}

/// Restart for the supervisor role: replaces the worker pool one slot at a time.
pub struct PoolRestart {
    pool: Arc<WorkerPool>,
}

impl PoolRestart {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RestartExecutor for PoolRestart {
    async fn restart(&self, reason: &RestartReason) -> Result<(), RestartError> {
        let report = self.pool.rolling_restart(&reason.to_string()).await;
        if report.replaced.is_empty() && self.pool.size() > 0 {
            return Err(RestartError::Failed(format!(
                "no worker could be replaced ({} failures)",
                report.failures.len()
            )));
        }
        Ok(())
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::time::Instant;

const ERROR_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ProcessVitals {
    pub rss_bytes: u64,
    /// Virtual memory size; the closest analogue to a managed heap figure.
    pub heap_used_bytes: u64,
    pub cpu_percent: f32,
}

pub trait VitalsSampler: Send {
    fn sample(&mut self) -> Option<ProcessVitals>;
}

pub type PidSource = Arc<dyn Fn() -> Vec<u32> + Send + Sync>;

/// Reads RSS, virtual memory and CPU usage through `sysinfo`. Tracks either the current
/// process or a changing set of processes, such as a worker pool. With several processes
/// each figure is the worst single process, so per-process thresholds keep their meaning.
pub struct ProcessSampler {
    system: System,
    pids: PidSource,
}

impl ProcessSampler {
    pub fn current() -> Self {
        let pid = std::process::id();
        Self::tracking(Arc::new(move || vec![pid]))
    }

    pub fn tracking(pids: PidSource) -> Self {
        Self { system: System::new(), pids }
    }
}

impl VitalsSampler for ProcessSampler {
    fn sample(&mut self) -> Option<ProcessVitals> {
        let mut readings = Vec::new();
        for raw in (self.pids)() {
            let pid = Pid::from(raw as usize);
            self.system.refresh_process(pid);
            if let Some(process) = self.system.process(pid) {
                readings.push(ProcessVitals {
                    rss_bytes: process.memory(),
                    heap_used_bytes: process.virtual_memory(),
                    cpu_percent: process.cpu_usage(),
                });
            }
        }
        worst(readings)
    }
}

/// Field-wise maximum over per-process readings; `None` when nothing was readable.
pub fn worst(readings: impl IntoIterator<Item = ProcessVitals>) -> Option<ProcessVitals> {
    readings.into_iter().reduce(|left, right| ProcessVitals {
        rss_bytes: left.rss_bytes.max(right.rss_bytes),
        heap_used_bytes: left.heap_used_bytes.max(right.heap_used_bytes),
        cpu_percent: left.cpu_percent.max(right.cpu_percent),
    })
}

/// Trailing one-minute count of request errors, plus a lifetime total.
#[derive(Clone, Default)]
pub struct ErrorTracker {
    events: Arc<Mutex<VecDeque<Instant>>>,
    total: Arc<AtomicU64>,
}

impl ErrorTracker {
    pub fn record(&self) {
        self.record_many(1);
    }

    /// Records `count` errors at the current instant, e.g. a batch reported by a worker.
    pub fn record_many(&self, count: u64) {
        if count == 0 {
            return;
        }
        let now = Instant::now();
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        prune(&mut events, now);
        for _ in 0..count {
            events.push_back(now);
        }
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn recent(&self) -> usize {
        let now = Instant::now();
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        prune(&mut events, now);
        events.len()
    }
}

fn prune(events: &mut VecDeque<Instant>, now: Instant) {
    while let Some(at) = events.front() {
        if now.saturating_duration_since(*at) < ERROR_WINDOW {
            break;
        }
        events.pop_front();
    }
}

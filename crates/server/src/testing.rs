use async_trait::async_trait;
use sluice_core::health::{
    ProcessVitals, RestartError, RestartExecutor, RestartReason, VitalsSampler,
};

/// Reports the same vitals on every sample.
pub struct StaticSampler {
    pub rss_bytes: u64,
}

impl VitalsSampler for StaticSampler {
    fn sample(&mut self) -> Option<ProcessVitals> {
        Some(ProcessVitals {
            rss_bytes: self.rss_bytes,
            heap_used_bytes: self.rss_bytes,
            cpu_percent: 0.0,
        })
    }
}

pub struct NoopRestart;

#[async_trait]
impl RestartExecutor for NoopRestart {
    async fn restart(&self, _reason: &RestartReason) -> Result<(), RestartError> {
        Ok(())
    }
}

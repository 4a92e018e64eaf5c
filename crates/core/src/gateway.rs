//! Request pipeline: admission, cache lookup, deduplicated origin call, cache fill and
//! response-size check, in that order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionStats, ResponseSizeGovernor, Ticket};
use crate::cache::{CacheInsert, CachePolicy, CacheStats, ResponseCache};
use crate::config::AppConfig;
use crate::dedup::{BatchFetcher, DedupStats, DeduplicationBatcher, FlightRole, RequestDescriptor};
use crate::errors::{GatewayError, OriginError};
use crate::health::{ErrorTracker, LoadProbe, LoadSnapshot};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl OriginResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: None, body: body.into() }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: Some("application/json".to_string()), body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Upstream call used on a cache miss. Retries and timeouts are the implementation's own.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError>;

    fn supports_batch(&self) -> bool {
        false
    }

    /// One combined call for a closed batch window. Results must follow request order.
    async fn fetch_batch(
        &self,
        requests: Vec<RequestDescriptor>,
    ) -> Result<Vec<OriginResponse>, OriginError> {
        let _ = requests;
        Err(OriginError::new("origin does not support batched calls"))
    }
}

struct BatchingOrigin(Arc<dyn OriginFetcher>);

#[async_trait]
impl BatchFetcher<OriginResponse> for BatchingOrigin {
    async fn fetch_batch(
        &self,
        requests: Vec<RequestDescriptor>,
    ) -> Result<Vec<OriginResponse>, OriginError> {
        self.0.fetch_batch(requests).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Origin,
    Shared,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Origin => "origin",
            Self::Shared => "shared",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayResponse {
    pub source: ResponseSource,
    pub response: OriginResponse,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GatewayStats {
    pub admission: AdmissionStats,
    pub cache: CacheStats,
    pub dedup: DedupStats,
}

#[derive(Clone)]
pub struct Gateway {
    admission: AdmissionController,
    governor: ResponseSizeGovernor,
    cache: ResponseCache<OriginResponse>,
    policy: CachePolicy,
    dedup: DeduplicationBatcher<OriginResponse>,
    batch_routes: Vec<String>,
    errors: ErrorTracker,
}

impl Gateway {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            admission: AdmissionController::new(&config.admission),
            governor: ResponseSizeGovernor::new(config.admission.max_response_size_bytes),
            cache: ResponseCache::new(&config.cache),
            policy: CachePolicy::from_config(&config.cache),
            dedup: DeduplicationBatcher::new(&config.dedup),
            batch_routes: config.dedup.batch_routes.clone(),
            errors: ErrorTracker::default(),
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn cache(&self) -> &ResponseCache<OriginResponse> {
        &self.cache
    }

    pub fn dedup(&self) -> &DeduplicationBatcher<OriginResponse> {
        &self.dedup
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn queue_timeout(&self) -> Duration {
        self.admission.queue_timeout()
    }

    pub async fn handle(
        &self,
        ticket: Ticket,
        request: RequestDescriptor,
        origin: Arc<dyn OriginFetcher>,
    ) -> Result<GatewayResponse, GatewayError> {
        let correlation_id = ticket.id.clone();
        let _permit = self.admission.admit(ticket).await?;

        let key = request.fingerprint();
        let ttl = self.policy.ttl_for(&request);
        if ttl.is_some() {
            if let Some(hit) = self.cache.get(&key) {
                debug!(
                    event_name = "gateway.cache.hit",
                    correlation_id = %correlation_id,
                    key = %key,
                    "served from cache"
                );
                self.governor.check(hit.body.len(), &correlation_id)?;
                return Ok(GatewayResponse { source: ResponseSource::Cache, response: hit });
            }
        }

        let (role, result) = match self.batch_group(&request) {
            Some(group) if origin.supports_batch() => {
                let group = group.to_string();
                let fetcher = Arc::new(BatchingOrigin(origin));
                self.dedup.run_batched(&key, &group, request, fetcher).await
            }
            _ => {
                let fetch = move || async move { origin.fetch(request).await };
                self.dedup.run_with_role(&key, fetch).await
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                // One origin failure counts once, however many callers shared it.
                if role == FlightRole::Leader && error.is_server_fault() {
                    self.errors.record();
                }
                warn!(
                    event_name = "gateway.origin.failed",
                    correlation_id = %correlation_id,
                    key = %key,
                    status = error.status,
                    error = %error,
                    "origin call failed"
                );
                return Err(error.into());
            }
        };

        if role == FlightRole::Leader && response.is_success() {
            if let Some(ttl) = ttl {
                self.fill_cache(&key, &response, ttl, &correlation_id);
            }
        }

        self.governor.check(response.body.len(), &correlation_id)?;
        let source = match role {
            FlightRole::Leader => ResponseSource::Origin,
            FlightRole::Follower => ResponseSource::Shared,
        };
        Ok(GatewayResponse { source, response })
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            admission: self.admission.stats(),
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
        }
    }

    /// Periodically purges expired cache entries and settled deduplication entries.
    pub fn spawn_maintenance(
        &self,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = gateway.cache.purge_expired();
                        let settled = gateway.dedup.purge_expired();
                        if expired > 0 || settled > 0 {
                            info!(
                                event_name = "gateway.maintenance.swept",
                                cache_expired = expired,
                                dedup_settled = settled,
                                "maintenance sweep completed"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn batch_group(&self, request: &RequestDescriptor) -> Option<&str> {
        self.batch_routes
            .iter()
            .find(|prefix| request.path.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    fn fill_cache(
        &self,
        key: &str,
        response: &OriginResponse,
        ttl: Duration,
        correlation_id: &str,
    ) {
        match self.cache.set(key, response.clone(), Some(ttl)) {
            Ok(CacheInsert::Stored { evicted, .. }) => debug!(
                event_name = "gateway.cache.filled",
                correlation_id,
                key,
                evicted,
                "origin response cached"
            ),
            Ok(CacheInsert::Rejected { size, limit }) => debug!(
                event_name = "gateway.cache.skipped",
                correlation_id,
                key,
                size,
                limit,
                "origin response too large to cache"
            ),
            Err(error) => warn!(
                event_name = "gateway.cache.fill_failed",
                correlation_id,
                key,
                error = %error,
                "could not cache origin response"
            ),
        }
    }
}

impl LoadProbe for Gateway {
    fn load(&self) -> LoadSnapshot {
        let admission = self.admission.stats();
        let cache = self.cache.stats();
        LoadSnapshot {
            active_requests: admission.active_requests,
            queue_length: admission.queue_length,
            cache_entries: cache.entries,
            cache_memory_bytes: cache.memory_usage_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::task::JoinSet;

    use super::{Gateway, GatewayResponse, OriginFetcher, OriginResponse, ResponseSource};
    use crate::admission::Ticket;
    use crate::config::AppConfig;
    use crate::dedup::RequestDescriptor;
    use crate::errors::{GatewayError, OriginError};
    use crate::health::LoadProbe;

    #[derive(Default)]
    struct CountingOrigin {
        calls: AtomicUsize,
        batch_calls: AtomicUsize,
        fail: Option<u16>,
        delay: Duration,
        body: String,
    }

    #[async_trait]
    impl OriginFetcher for CountingOrigin {
        async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(status) = self.fail {
                return Err(OriginError::with_status(status, "crm unavailable"));
            }
            if self.body.is_empty() {
                Ok(OriginResponse::json(200, format!("{{\"path\":\"{}\"}}", request.path)))
            } else {
                Ok(OriginResponse::new(200, self.body.clone()))
            }
        }

        fn supports_batch(&self) -> bool {
            true
        }

        async fn fetch_batch(
            &self,
            requests: Vec<RequestDescriptor>,
        ) -> Result<Vec<OriginResponse>, OriginError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(requests
                .iter()
                .map(|request| OriginResponse::json(200, format!("\"{}\"", request.path)))
                .collect())
        }
    }

    fn gateway(configure: impl FnOnce(&mut AppConfig)) -> Gateway {
        let mut config = AppConfig::default();
        configure(&mut config);
        Gateway::new(&config)
    }

    async fn send(
        gateway: &Gateway,
        id: &str,
        method: &str,
        path: &str,
        origin: Arc<CountingOrigin>,
    ) -> Result<GatewayResponse, GatewayError> {
        let request = RequestDescriptor::new(method, path);
        gateway.handle(Ticket::new(id, "client"), request, origin).await
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let gateway = gateway(|_| {});
        let origin = Arc::new(CountingOrigin::default());

        let first = send(&gateway, "req-1", "GET", "/api/crm/a", origin.clone())
            .await
            .expect("first request succeeds");
        let second = send(&gateway, "req-2", "GET", "/api/crm/a", origin.clone())
            .await
            .expect("second request succeeds");

        assert_eq!(first.source, ResponseSource::Origin);
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(first.response, second.response);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.admission().stats().active_requests, 0);
    }

    #[tokio::test]
    async fn writes_bypass_the_cache() {
        let gateway = gateway(|config| config.dedup.dedup_ttl_ms = 0);
        let origin = Arc::new(CountingOrigin::default());

        for id in ["req-1", "req-2"] {
            send(&gateway, id, "POST", "/api/llm/complete", origin.clone())
                .await
                .expect("write succeeds");
        }

        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(gateway.cache().keys().is_empty());
    }

    #[tokio::test]
    async fn origin_errors_are_counted_and_not_cached() {
        let gateway = gateway(|_| {});
        let origin = Arc::new(CountingOrigin { fail: Some(502), ..CountingOrigin::default() });

        let error = send(&gateway, "req-1", "GET", "/api/crm/a", origin)
            .await
            .expect_err("origin failure propagates");

        assert_eq!(error, GatewayError::Origin(OriginError::with_status(502, "crm unavailable")));
        assert_eq!(gateway.errors().recent(), 1);
        assert!(gateway.cache().keys().is_empty());
    }

    async fn burst(gateway: &Gateway, origin: Arc<CountingOrigin>, callers: usize) -> usize {
        let mut tasks = JoinSet::new();
        for index in 0..callers {
            let gateway = gateway.clone();
            let origin = origin.clone();
            tasks.spawn(async move {
                send(&gateway, &format!("req-{index}"), "GET", "/api/crm/a", origin).await
            });
        }
        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.expect("task completes").is_err() {
                failures += 1;
            }
        }
        failures
    }

    #[tokio::test(start_paused = true)]
    async fn a_shared_failure_is_counted_once() {
        let gateway = gateway(|config| config.admission.max_concurrent_requests = 64);
        let origin = Arc::new(CountingOrigin {
            fail: Some(503),
            delay: Duration::from_millis(50),
            ..CountingOrigin::default()
        });

        let failures = burst(&gateway, origin.clone(), 60).await;

        assert_eq!(failures, 60);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.errors().recent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_count_toward_the_error_rate() {
        let gateway = gateway(|config| config.admission.max_concurrent_requests = 64);
        let origin = Arc::new(CountingOrigin {
            fail: Some(404),
            delay: Duration::from_millis(50),
            ..CountingOrigin::default()
        });

        let failures = burst(&gateway, origin.clone(), 60).await;

        assert_eq!(failures, 60);
        assert_eq!(gateway.errors().recent(), 0);
    }

    #[tokio::test]
    async fn oversized_responses_are_refused() {
        let gateway = gateway(|config| config.admission.max_response_size_bytes = 16);
        let origin =
            Arc::new(CountingOrigin { body: "x".repeat(64), ..CountingOrigin::default() });

        let error = send(&gateway, "req-1", "GET", "/api/crm/big", origin)
            .await
            .expect_err("oversized response is refused");

        assert_eq!(error, GatewayError::ResponseTooLarge { size: 64, limit: 16 });
        assert_eq!(gateway.admission().stats().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_routes_use_the_combined_call() {
        let gateway = gateway(|config| {
            config.dedup.batch_routes = vec!["/api/crm/contacts".to_string()];
            config.dedup.batch_size = 2;
        });
        let origin = Arc::new(CountingOrigin::default());

        let (left, right) = tokio::join!(
            send(&gateway, "req-1", "GET", "/api/crm/contacts/1", origin.clone()),
            send(&gateway, "req-2", "GET", "/api/crm/contacts/2", origin.clone()),
        );

        assert_eq!(left.expect("left").response.body, "\"/api/crm/contacts/1\"");
        assert_eq!(right.expect("right").response.body, "\"/api/crm/contacts/2\"");
        assert_eq!(origin.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.load().cache_entries, 2);
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_core::admission::Ticket;
use sluice_core::config::AppConfig;
use sluice_core::dedup::RequestDescriptor;
use sluice_core::errors::{OriginError, RejectReason};
use sluice_core::gateway::{Gateway, OriginFetcher, OriginResponse, ResponseSource};
use sluice_core::GatewayError;

struct SlowOrigin {
    gateway: Gateway,
    calls: AtomicUsize,
    peak_active: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl OriginFetcher for SlowOrigin {
    async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        let active = self.gateway.admission().stats().active_requests;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(OriginResponse::json(200, format!("{{\"path\":\"{}\",\"call\":{call}}}", request.path)))
    }
}

fn gateway(max_concurrent: usize, queue_timeout_ms: u64) -> Gateway {
    let mut config = AppConfig::default();
    config.admission.max_concurrent_requests = max_concurrent;
    config.admission.queue_timeout_ms = queue_timeout_ms;
    Gateway::new(&config)
}

fn origin(gateway: &Gateway, delay: Duration) -> Arc<SlowOrigin> {
    Arc::new(SlowOrigin {
        gateway: gateway.clone(),
        calls: AtomicUsize::new(0),
        peak_active: AtomicUsize::new(0),
        delay,
    })
}

#[tokio::test(start_paused = true)]
async fn three_identical_reads_share_one_origin_call() {
    let gateway = gateway(2, 30_000);
    let origin = origin(&gateway, Duration::from_millis(50));
    let request = RequestDescriptor::new("GET", "/api/crm/contacts").with_query("page", "1");

    let (first, second, third) = tokio::join!(
        gateway.handle(Ticket::new("req-1", "client-a"), request.clone(), origin.clone()),
        gateway.handle(Ticket::new("req-2", "client-b"), request.clone(), origin.clone()),
        gateway.handle(Ticket::new("req-3", "client-c"), request.clone(), origin.clone()),
    );

    let first = first.expect("first request succeeds");
    let second = second.expect("second request succeeds");
    let third = third.expect("third request succeeds");

    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    assert!(origin.peak_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(first.response, second.response);
    assert_eq!(second.response, third.response);
    assert_eq!(first.source, ResponseSource::Origin);
    assert_eq!(second.source, ResponseSource::Shared);
    assert_ne!(third.source, ResponseSource::Origin);

    let stats = gateway.stats();
    assert_eq!(stats.admission.active_requests, 0);
    assert_eq!(stats.admission.total_queued, 1);
    assert_eq!(stats.admission.total_processed, 3);
    assert_eq!(stats.dedup.origin_calls, 1);
    assert!(stats.dedup.duplicates_saved >= 1);
    assert_eq!(stats.cache.entries, 1);
}

#[tokio::test(start_paused = true)]
async fn queued_request_times_out_while_slots_stay_busy() {
    let gateway = gateway(1, 100);
    let origin = origin(&gateway, Duration::from_secs(1));

    let (slow, late) = tokio::join!(
        gateway.handle(
            Ticket::new("req-1", "client-a"),
            RequestDescriptor::new("GET", "/api/llm/slow"),
            origin.clone()
        ),
        gateway.handle(
            Ticket::new("req-2", "client-b"),
            RequestDescriptor::new("GET", "/api/llm/other"),
            origin.clone()
        ),
    );

    assert!(slow.is_ok());
    assert!(matches!(
        late,
        Err(GatewayError::Rejected(RejectReason::QueueTimeout { waited_ms })) if waited_ms >= 100
    ));
    let stats = gateway.admission().stats();
    assert_eq!(stats.total_timeouts, 1);
    assert_eq!(stats.queue_length, 0);
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
}

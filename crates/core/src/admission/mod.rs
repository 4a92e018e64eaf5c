//! Bounded-concurrency admission with a strict FIFO wait queue.
//!
//! A ticket proceeds immediately while fewer than `max_concurrent` requests are active and
//! nobody is waiting ahead of it. Otherwise it joins the queue with a deadline. Whether a
//! queued ticket is promoted or times out is decided under the controller mutex, so each
//! ticket leaves the queue exactly once.

pub mod governor;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;
use crate::errors::RejectReason;

pub use governor::ResponseSizeGovernor;

#[derive(Clone, Debug)]
pub struct Ticket {
    pub id: String,
    pub received_at: Instant,
    pub size_estimate: usize,
    pub client_key: String,
}

impl Ticket {
    pub fn new(id: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            received_at: Instant::now(),
            size_estimate: 0,
            client_key: client_key.into(),
        }
    }

    pub fn with_size_estimate(mut self, size_estimate: usize) -> Self {
        self.size_estimate = size_estimate;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub active_requests: usize,
    pub max_concurrent: usize,
    pub queue_length: usize,
    pub total_queued: u64,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    pub draining: bool,
}

pub enum Admission {
    Proceed(AdmissionPermit),
    Queued(QueuedAdmission),
    Rejected(RejectReason),
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrent: usize,
    max_queue_length: usize,
    queue_timeout: Duration,
    state: Mutex<AdmissionState>,
    active_tx: watch::Sender<usize>,
}

#[derive(Default)]
struct AdmissionState {
    active: usize,
    queue: VecDeque<Waiter>,
    draining: bool,
    next_seq: u64,
    total_queued: u64,
    total_processed: u64,
    total_rejected: u64,
    total_timeouts: u64,
    total_cancelled: u64,
}

struct Waiter {
    seq: u64,
    ticket_id: String,
    tx: oneshot::Sender<Result<(), RejectReason>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                max_concurrent: config.max_concurrent_requests.max(1),
                max_queue_length: config.max_queue_length,
                queue_timeout: config.queue_timeout(),
                state: Mutex::new(AdmissionState::default()),
                active_tx,
            }),
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        self.inner.queue_timeout
    }

    /// Decides a ticket's fate without waiting.
    pub fn accept(&self, ticket: Ticket) -> Admission {
        let mut state = self.inner.lock();

        if state.draining {
            state.total_rejected += 1;
            debug!(
                event_name = "admission.ticket.rejected",
                correlation_id = %ticket.id,
                reason = "draining",
                "ticket rejected while draining"
            );
            return Admission::Rejected(RejectReason::Draining);
        }

        if state.active < self.inner.max_concurrent && state.queue.is_empty() {
            state.active += 1;
            self.inner.publish_active(state.active);
            return Admission::Proceed(AdmissionPermit::new(self.inner.clone(), ticket.id));
        }

        if state.queue.len() >= self.inner.max_queue_length {
            state.total_rejected += 1;
            let queue_length = state.queue.len();
            warn!(
                event_name = "admission.ticket.overloaded",
                correlation_id = %ticket.id,
                client_key = %ticket.client_key,
                queue_length,
                "admission queue full; rejecting ticket"
            );
            return Admission::Rejected(RejectReason::Overloaded { queue_length });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_queued += 1;

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter { seq, ticket_id: ticket.id.clone(), tx });
        info!(
            event_name = "admission.ticket.queued",
            correlation_id = %ticket.id,
            client_key = %ticket.client_key,
            queue_length = state.queue.len(),
            active = state.active,
            "ticket queued for a free slot"
        );

        let deadline = ticket.received_at + self.inner.queue_timeout;
        Admission::Queued(QueuedAdmission {
            inner: self.inner.clone(),
            seq,
            ticket,
            deadline,
            rx,
            settled: false,
        })
    }

    /// Awaiting form of [`accept`](Self::accept): resolves once the ticket holds a slot.
    pub async fn admit(&self, ticket: Ticket) -> Result<AdmissionPermit, RejectReason> {
        match self.accept(ticket) {
            Admission::Proceed(permit) => Ok(permit),
            Admission::Queued(queued) => queued.wait().await,
            Admission::Rejected(reason) => Err(reason),
        }
    }

    /// Stops admitting, rejects every queued ticket, and waits for in-flight requests.
    ///
    /// Returns `true` when the active count reached zero before `grace` elapsed.
    pub async fn drain(&self, grace: Duration) -> bool {
        let rejected = {
            let mut state = self.inner.lock();
            state.draining = true;
            let waiters: Vec<Waiter> = state.queue.drain(..).collect();
            state.total_rejected += waiters.len() as u64;
            waiters
        };

        let rejected_count = rejected.len();
        for waiter in rejected {
            let _ = waiter.tx.send(Err(RejectReason::Draining));
        }

        let active = self.stats().active_requests;
        info!(
            event_name = "admission.drain.started",
            rejected_queued = rejected_count,
            active,
            grace_ms = grace.as_millis() as u64,
            "admission draining"
        );

        let mut active_rx = self.inner.active_tx.subscribe();
        let drained =
            matches!(timeout(grace, active_rx.wait_for(|count| *count == 0)).await, Ok(Ok(_)));

        if drained {
            info!(event_name = "admission.drain.completed", "all in-flight requests completed");
        } else {
            warn!(
                event_name = "admission.drain.timeout",
                active = self.stats().active_requests,
                "drain grace period elapsed with requests still active"
            );
        }
        drained
    }

    pub fn resume(&self) {
        let mut state = self.inner.lock();
        state.draining = false;
        info!(event_name = "admission.resumed", "admission reopened");
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.inner.lock();
        AdmissionStats {
            active_requests: state.active,
            max_concurrent: self.inner.max_concurrent,
            queue_length: state.queue.len(),
            total_queued: state.total_queued,
            total_processed: state.total_processed,
            total_rejected: state.total_rejected,
            total_timeouts: state.total_timeouts,
            total_cancelled: state.total_cancelled,
            draining: state.draining,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_active(&self, active: usize) {
        self.active_tx.send_replace(active);
    }

    fn release(&self, ticket_id: &str) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        state.total_processed += 1;
        debug!(
            event_name = "admission.slot.released",
            correlation_id = %ticket_id,
            active = state.active,
            "admission slot released"
        );
        self.promote(&mut state);
        self.publish_active(state.active);
    }

    /// Hands free slots to the queue head, in order. Iterative so a burst of
    /// completions never deepens the stack.
    fn promote(&self, state: &mut AdmissionState) {
        if state.draining {
            return;
        }

        while state.active < self.max_concurrent {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            if waiter.tx.send(Ok(())).is_err() {
                state.active -= 1;
                continue;
            }
            debug!(
                event_name = "admission.ticket.promoted",
                correlation_id = %waiter.ticket_id,
                active = state.active,
                "queued ticket promoted"
            );
        }
    }

    fn remove_queued(state: &mut AdmissionState, seq: u64) -> bool {
        match state.queue.iter().position(|waiter| waiter.seq == seq) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Held while a request occupies a slot. Dropping it frees the slot and promotes the
/// next queued ticket.
pub struct AdmissionPermit {
    inner: Arc<Inner>,
    ticket_id: String,
}

impl AdmissionPermit {
    fn new(inner: Arc<Inner>, ticket_id: String) -> Self {
        Self { inner, ticket_id }
    }

    pub fn ticket_id(&self) -> &str {
        &self.ticket_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.release(&self.ticket_id);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").field("ticket_id", &self.ticket_id).finish()
    }
}

/// A ticket waiting in the queue. Dropping it before it resolves withdraws the ticket.
pub struct QueuedAdmission {
    inner: Arc<Inner>,
    seq: u64,
    ticket: Ticket,
    deadline: Instant,
    rx: oneshot::Receiver<Result<(), RejectReason>>,
    settled: bool,
}

impl QueuedAdmission {
    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub async fn wait(mut self) -> Result<AdmissionPermit, RejectReason> {
        let outcome = match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(Ok(()))) => Ok(self.permit()),
            Ok(Ok(Err(reason))) => Err(reason),
            Ok(Err(_)) => Err(RejectReason::Draining),
            Err(_) => self.expire(),
        };
        self.settled = true;
        outcome
    }

    fn expire(&mut self) -> Result<AdmissionPermit, RejectReason> {
        let waited_ms = self.ticket.received_at.elapsed().as_millis() as u64;
        {
            let mut state = self.inner.lock();
            if Inner::remove_queued(&mut state, self.seq) {
                state.total_timeouts += 1;
                state.total_rejected += 1;
                warn!(
                    event_name = "admission.queue.timeout",
                    correlation_id = %self.ticket.id,
                    client_key = %self.ticket.client_key,
                    waited_ms,
                    "queued ticket timed out"
                );
                return Err(RejectReason::QueueTimeout { waited_ms });
            }
        }

        // Promotion won the race; the grant is already in the channel.
        match self.rx.try_recv() {
            Ok(Ok(())) => Ok(self.permit()),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(RejectReason::QueueTimeout { waited_ms }),
        }
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit::new(self.inner.clone(), self.ticket.id.clone())
    }
}

impl Drop for QueuedAdmission {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        {
            let mut state = self.inner.lock();
            if Inner::remove_queued(&mut state, self.seq) {
                state.total_cancelled += 1;
                debug!(
                    event_name = "admission.ticket.cancelled",
                    correlation_id = %self.ticket.id,
                    "queued ticket withdrawn by client"
                );
                return;
            }
        }

        if let Ok(Ok(())) = self.rx.try_recv() {
            drop(self.permit());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::advance;

    use super::{Admission, AdmissionController, AdmissionPermit, QueuedAdmission, Ticket};
    use crate::config::AdmissionConfig;
    use crate::errors::RejectReason;

    fn controller(max_concurrent: usize, max_queue_length: usize) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_concurrent_requests: max_concurrent,
            max_queue_length,
            queue_timeout_ms: 30_000,
            max_response_size_bytes: 1024,
        })
    }

    fn proceed(controller: &AdmissionController, id: &str) -> AdmissionPermit {
        match controller.accept(Ticket::new(id, "client")) {
            Admission::Proceed(permit) => permit,
            _ => panic!("ticket {id} should proceed"),
        }
    }

    fn queued(controller: &AdmissionController, id: &str) -> QueuedAdmission {
        match controller.accept(Ticket::new(id, "client")) {
            Admission::Queued(queued) => queued,
            _ => panic!("ticket {id} should queue"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_max_concurrent_then_fifo_promotion() {
        let controller = controller(2, 10);
        let first = proceed(&controller, "r1");
        let _second = proceed(&controller, "r2");
        let third = queued(&controller, "r3");
        let fourth = queued(&controller, "r4");

        let stats = controller.stats();
        assert_eq!(stats.active_requests, 2);
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.total_queued, 2);

        drop(first);
        let promoted = third.wait().await.expect("head of queue should be promoted");
        assert_eq!(promoted.ticket_id(), "r3");

        let stats = controller.stats();
        assert_eq!(stats.active_requests, 2);
        assert_eq!(stats.queue_length, 1);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(fourth.ticket().id, "r4");
    }

    #[tokio::test]
    async fn long_queue_drains_in_order_one_handoff_per_release() {
        let controller = controller(1, 2_000);
        let holder = proceed(&controller, "holder");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for index in 0..1_000 {
            let waiting = queued(&controller, &format!("r{index}"));
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let permit = waiting.wait().await.expect("every ticket is promoted");
                order.lock().expect("lock").push(index);
                drop(permit);
            }));
        }
        assert_eq!(controller.stats().queue_length, 1_000);

        drop(holder);
        for task in tasks {
            task.await.expect("task completes");
        }

        assert_eq!(*order.lock().expect("lock"), (0..1_000).collect::<Vec<_>>());
        let stats = controller.stats();
        assert_eq!(stats.total_processed, 1_001);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_exactly_once() {
        let controller = controller(1, 10);
        let holder = proceed(&controller, "r1");

        let waiting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.admit(Ticket::new("r2", "client")).await }
        });

        let outcome = waiting.await.expect("admit task should not panic");
        assert!(matches!(
            outcome,
            Err(RejectReason::QueueTimeout { waited_ms }) if waited_ms >= 30_000
        ));

        let stats = controller.stats();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.queue_length, 0);

        drop(holder);
        let stats = controller.stats();
        assert_eq!(stats.active_requests, 0, "timed-out ticket must not be promoted later");
        assert_eq!(stats.total_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_before_deadline_wins_over_timeout() {
        let controller = controller(1, 10);
        let holder = proceed(&controller, "r1");
        let waiting = queued(&controller, "r2");

        advance(Duration::from_secs(29)).await;
        drop(holder);

        let permit = waiting.wait().await.expect("slot freed before the deadline");
        assert_eq!(permit.ticket_id(), "r2");
        assert_eq!(controller.stats().total_timeouts, 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_as_overloaded() {
        let controller = controller(1, 1);
        let _holder = proceed(&controller, "r1");
        let _waiting = queued(&controller, "r2");

        let outcome = controller.accept(Ticket::new("r3", "client"));
        assert!(matches!(
            outcome,
            Admission::Rejected(RejectReason::Overloaded { queue_length: 1 })
        ));
        assert_eq!(controller.stats().total_rejected, 1);
    }

    #[tokio::test]
    async fn dropping_a_queued_ticket_withdraws_it() {
        let controller = controller(1, 10);
        let holder = proceed(&controller, "r1");
        let waiting = queued(&controller, "r2");

        drop(waiting);
        let stats = controller.stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.total_cancelled, 1);

        drop(holder);
        assert_eq!(controller.stats().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_rejects_queue_and_waits_for_active() {
        let controller = controller(1, 10);
        let holder = proceed(&controller, "r1");
        let waiting = queued(&controller, "r2");

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(holder);
        });

        let drained = controller.drain(Duration::from_secs(5)).await;
        assert!(drained);
        assert!(matches!(waiting.wait().await, Err(RejectReason::Draining)));
        assert!(matches!(
            controller.accept(Ticket::new("r3", "client")),
            Admission::Rejected(RejectReason::Draining)
        ));
        releaser.await.expect("releaser task should finish");

        controller.resume();
        let _permit = proceed(&controller, "r4");
        assert!(!controller.stats().draining);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_timeout_when_requests_stay_active() {
        let controller = controller(1, 10);
        let _holder = proceed(&controller, "r1");

        assert!(!controller.drain(Duration::from_secs(2)).await);
        assert_eq!(controller.stats().active_requests, 1);
    }
}

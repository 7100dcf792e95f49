//! # Feature: Global Rate Governor
//!
//! Single admission gate in front of every outbound API call. Admissions are
//! tracked as a sliding log over `window`, so no `window`-long interval ever
//! sees more than `max_requests_per_window` dispatches. Excess calls wait in a
//! global FIFO that a background refill task drains as slots free up.
//!
//! - **Version**: 2.2.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.2.0: A submission whose deadline beats its permit hands the slot back
//! - 2.1.0: Deadlines, optional retry cap, counters for the status feed
//! - 2.0.0: Global 429 pauses every admission until its retry-after elapses
//! - 1.0.0: Initial release replacing the per-user limiter with a process-wide budget

use crate::core::error::GovernanceError;
use crate::core::status::GovernorStatus;
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

/// Budget settings for the governor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorConfig {
    pub max_requests_per_window: u32,
    pub window: Duration,
    /// Cap on rate-limited retries per submission; `None` retries forever
    pub max_rate_limit_retries: Option<u32>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            max_requests_per_window: 50,
            window: Duration::from_secs(1),
            max_rate_limit_retries: None,
        }
    }
}

/// A submission waiting for a free slot. The permit carries the admission
/// instant so an unclaimed slot can be handed back.
struct AdmissionTicket {
    permit: oneshot::Sender<Instant>,
    enqueued_at: Instant,
}

impl AdmissionTicket {
    fn is_abandoned(&self) -> bool {
        self.permit.is_closed()
    }
}

/// Process-wide window accounting. Only touched under the governor's lock.
#[derive(Default)]
struct WindowState {
    /// Admission instants still inside the window, oldest first
    admissions: VecDeque<Instant>,
    pending: VecDeque<AdmissionTicket>,
    paused_until: Option<Instant>,
    total_admitted: u64,
    total_rate_limited: u64,
    total_failed: u64,
}

impl WindowState {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admissions.front() {
            if now.duration_since(oldest) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_paused(&mut self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) if until > now => true,
            Some(_) => {
                self.paused_until = None;
                false
            }
            None => false,
        }
    }

    /// Hand out permits from the front of the queue while budget remains.
    /// Abandoned tickets are skipped without consuming a slot.
    fn drain(&mut self, now: Instant, config: &GovernorConfig) -> usize {
        self.expire(now, config.window);
        if self.is_paused(now) {
            return 0;
        }

        let mut admitted = 0;
        while self.admissions.len() < config.max_requests_per_window as usize {
            let Some(ticket) = self.pending.pop_front() else {
                break;
            };
            let waited = now.duration_since(ticket.enqueued_at);
            if ticket.permit.send(now).is_ok() {
                self.admissions.push_back(now);
                self.total_admitted += 1;
                admitted += 1;
                if !waited.is_zero() {
                    debug!("Admitted queued operation after {waited:?}");
                }
            }
        }
        admitted
    }

    /// Return a slot that was granted but never used
    fn release(&mut self, admitted_at: Instant) {
        if let Some(pos) = self.admissions.iter().rposition(|&at| at == admitted_at) {
            self.admissions.remove(pos);
            self.total_admitted = self.total_admitted.saturating_sub(1);
        }
    }

    /// When the refill task should next look at the queue
    fn next_wake(&self, config: &GovernorConfig) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        let slot_free = if self.admissions.len() >= config.max_requests_per_window as usize {
            self.admissions.front().map(|&oldest| oldest + config.window)
        } else {
            None
        };
        match (self.paused_until, slot_free) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Absolute cutoff for one submission, plus the budget it was given
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Run `future` to completion, or until the deadline when there is one
    async fn bound<F: Future>(deadline: Option<Deadline>, future: F) -> Result<F::Output, GovernanceError> {
        match deadline {
            Some(deadline) => timeout_at(deadline.at, future)
                .await
                .map_err(|_| GovernanceError::Timeout(deadline.budget)),
            None => Ok(future.await),
        }
    }
}

/// Process-wide admission gate shared by every tenant queue and call site.
///
/// Construct one per process (or per test) and pass it around as an `Arc`.
pub struct GlobalRateGovernor {
    transport: Arc<dyn Transport>,
    config: GovernorConfig,
    state: Mutex<WindowState>,
    refill: Arc<Notify>,
}

impl GlobalRateGovernor {
    /// Create a governor and start its refill task. Must run inside a tokio runtime.
    pub fn new(config: GovernorConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        info!(
            "Rate governor online: {} requests per {:?}",
            config.max_requests_per_window, config.window
        );
        let governor = Arc::new(GlobalRateGovernor {
            transport,
            config,
            state: Mutex::new(WindowState::default()),
            refill: Arc::new(Notify::new()),
        });
        Self::spawn_refill_task(&governor);
        governor
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Wait for admission, dispatch, and transparently retry rate-limited calls.
    ///
    /// A rate-limited call sleeps out the retry-after, then rejoins the queue at
    /// the front. Other failures are returned as-is.
    pub async fn submit(&self, request: ApiRequest) -> Result<ApiResponse, GovernanceError> {
        self.dispatch(request, None).await
    }

    /// `submit` bounded by a deadline. On expiry the submission is dropped from
    /// the pending queue and `Timeout` is returned. A permit granted at the
    /// same moment the deadline fired goes back to the window.
    pub async fn submit_with_deadline(
        &self,
        request: ApiRequest,
        deadline: Duration,
    ) -> Result<ApiResponse, GovernanceError> {
        let deadline = Deadline {
            at: Instant::now() + deadline,
            budget: deadline,
        };
        let result = self.dispatch(request, Some(deadline)).await;
        if let Err(GovernanceError::Timeout(after)) = &result {
            debug!("Submission timed out after {after:?}");
        }
        result
    }

    async fn dispatch(
        &self,
        request: ApiRequest,
        deadline: Option<Deadline>,
    ) -> Result<ApiResponse, GovernanceError> {
        let mut rate_limited = 0u32;
        loop {
            self.admit(rate_limited > 0, deadline).await?;

            match Deadline::bound(deadline, self.transport.execute(&request)).await? {
                Ok(response) => return Ok(response),
                Err(TransportError::RateLimited { retry_after, global }) => {
                    rate_limited += 1;
                    self.record_rate_limit(retry_after, global).await;

                    if let Some(max) = self.config.max_rate_limit_retries {
                        if rate_limited > max {
                            warn!("{request} still rate limited after {rate_limited} attempts, giving up");
                            return Err(GovernanceError::RetriesExhausted {
                                attempts: rate_limited,
                            });
                        }
                    }

                    warn!("{request} rate limited (global: {global}), retrying in {retry_after:?}");
                    Deadline::bound(deadline, sleep(retry_after)).await?;
                }
                Err(TransportError::Failure { status, message }) => {
                    self.state.lock().await.total_failed += 1;
                    debug!("{request} failed: {message}");
                    return Err(GovernanceError::Transport { status, message });
                }
            }
        }
    }

    /// Drop queued tickets whose submitter has gone away
    pub async fn purge_abandoned(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|ticket| !ticket.is_abandoned());
        before - state.pending.len()
    }

    pub async fn status(&self) -> GovernorStatus {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire(now, self.config.window);

        let used = state.admissions.len() as u32;
        let window_remaining = state
            .admissions
            .front()
            .map(|&oldest| (oldest + self.config.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let paused_for = state
            .paused_until
            .filter(|&until| until > now)
            .map(|until| (until - now).as_millis() as u64);

        GovernorStatus {
            pending: state.pending.iter().filter(|t| !t.is_abandoned()).count(),
            requests_used: used,
            requests_remaining: self.config.max_requests_per_window.saturating_sub(used),
            max_requests: self.config.max_requests_per_window,
            window_ms: self.config.window.as_millis() as u64,
            window_remaining_ms: window_remaining.as_millis() as u64,
            paused_for_ms: paused_for,
            total_admitted: state.total_admitted,
            total_rate_limited: state.total_rate_limited,
            total_failed: state.total_failed,
        }
    }

    /// Queue for a slot (at the front for retries) and wait for the permit
    async fn admit(&self, front: bool, deadline: Option<Deadline>) -> Result<(), GovernanceError> {
        let (permit, mut admitted) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            let ticket = AdmissionTicket {
                permit,
                enqueued_at: Instant::now(),
            };
            if front {
                state.pending.push_front(ticket);
            } else {
                state.pending.push_back(ticket);
            }
            state.drain(Instant::now(), &self.config);
            if !state.pending.is_empty() {
                self.refill.notify_one();
            }
        }

        match Deadline::bound(deadline, &mut admitted).await {
            Ok(received) => received.map(|_| ()).map_err(|_| GovernanceError::Closed),
            Err(expired) => {
                // no permit can be sent after close; one that already was is returned
                admitted.close();
                let mut state = self.state.lock().await;
                if let Ok(admitted_at) = admitted.try_recv() {
                    state.release(admitted_at);
                    self.refill.notify_one();
                }
                state.pending.retain(|ticket| !ticket.is_abandoned());
                Err(expired)
            }
        }
    }

    async fn record_rate_limit(&self, retry_after: Duration, global: bool) {
        let mut state = self.state.lock().await;
        state.total_rate_limited += 1;
        if global {
            let until = Instant::now() + retry_after;
            let extended = state.paused_until.map_or(until, |current| current.max(until));
            state.paused_until = Some(extended);
            warn!("Global rate limit hit, pausing all admissions for {retry_after:?}");
        }
    }

    /// Drain what the budget allows and report when to look again
    async fn refill_pending(&self) -> Option<Instant> {
        let mut state = self.state.lock().await;
        let admitted = state.drain(Instant::now(), &self.config);
        if admitted > 0 {
            debug!(
                "Refill admitted {admitted} queued operations ({} still waiting)",
                state.pending.len()
            );
        }
        state.next_wake(&self.config)
    }

    fn spawn_refill_task(governor: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(governor);
        let notify = governor.refill.clone();
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                loop {
                    let wake_at = match weak.upgrade() {
                        Some(governor) => governor.refill_pending().await,
                        None => return,
                    };
                    match wake_at {
                        Some(at) => sleep_until(at).await,
                        None => break,
                    }
                }
            }
        });
    }
}

impl Drop for GlobalRateGovernor {
    fn drop(&mut self) {
        // wake the refill task so it notices the governor is gone
        self.refill.notify_one();
    }
}

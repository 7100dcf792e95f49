//! # Queue Supervisor
//!
//! Owns one ordered queue per tenant and the drain loops that feed them into
//! the global governor. Tenants run concurrently; within a tenant exactly one
//! operation is in flight at a time, in submission order.
//!
//! - **Version**: 1.3.0
//! - **Since**: 1.0.0
//!
//! ## Changelog
//! - 1.3.0: A re-added tenant waits for its predecessor's in-flight call; transport panics fail one operation
//! - 1.2.0: Deadlines via `execute_with_deadline`
//! - 1.1.0: Generation tags so a re-added tenant never shares a drain loop with its predecessor
//! - 1.0.0: Initial release

use super::queue::{OperationResult, QueuedOperation, TenantQueueState};
use crate::core::error::GovernanceError;
use crate::core::status::{GovernanceStatus, TenantQueueStatus};
use crate::core::types::TenantId;
use crate::features::rate_limiting::GlobalRateGovernor;
use crate::transport::ApiRequest;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout, Instant};

/// Settings shared by every tenant queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantQueueConfig {
    /// Minimum gap between consecutive dispatches from the same tenant
    pub pacing: Duration,
}

impl Default for TenantQueueConfig {
    fn default() -> Self {
        TenantQueueConfig {
            pacing: Duration::from_millis(100),
        }
    }
}

/// Handle to an enqueued operation; resolves with its result
pub struct PendingOperation {
    tenant_id: TenantId,
    receiver: oneshot::Receiver<OperationResult>,
}

impl PendingOperation {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Future for PendingOperation {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let tenant_id = self.tenant_id;
        // a dropped completion means the tenant's state was torn down
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GovernanceError::TenantRemoved(tenant_id))))
    }
}

pub struct QueueSupervisor {
    governor: Arc<GlobalRateGovernor>,
    config: TenantQueueConfig,
    tenants: DashMap<TenantId, TenantQueueState>,
    /// Dispatch locks of removed tenants whose last call was still in flight
    retired: DashMap<TenantId, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
}

impl QueueSupervisor {
    pub fn new(governor: Arc<GlobalRateGovernor>, config: TenantQueueConfig) -> Arc<Self> {
        Arc::new(QueueSupervisor {
            governor,
            config,
            tenants: DashMap::new(),
            retired: DashMap::new(),
            next_generation: AtomicU64::new(0),
        })
    }

    fn new_state(&self, tenant_id: TenantId) -> TenantQueueState {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let dispatch = self
            .retired
            .remove(&tenant_id)
            .map(|(_, lock)| lock)
            .unwrap_or_default();
        TenantQueueState::new(tenant_id, generation, dispatch)
    }

    /// Eagerly create a tenant's queue. Returns false if it already existed.
    pub fn on_tenant_added(&self, tenant_id: TenantId) -> bool {
        let mut created = false;
        self.tenants.entry(tenant_id).or_insert_with(|| {
            created = true;
            self.new_state(tenant_id)
        });
        if created {
            debug!("Tenant {tenant_id}: queue created");
        }
        created
    }

    /// Tear down a tenant's queue, failing whatever is still waiting with
    /// `TenantRemoved`. An operation already handed to the governor finishes.
    pub fn on_tenant_removed(&self, tenant_id: TenantId) -> usize {
        match self.tenants.remove(&tenant_id) {
            Some((_, state)) => {
                let dispatch = state.dispatch_lock();
                if dispatch.try_lock().is_err() {
                    self.retired.insert(tenant_id, dispatch);
                }
                let failed = state.fail_all();
                info!("Tenant {tenant_id}: queue removed ({failed} pending operations failed)");
                failed
            }
            None => 0,
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Append an operation to the tenant's queue, creating the queue for an
    /// unseen tenant, and start its drain loop if the queue was idle.
    pub fn enqueue(self: &Arc<Self>, tenant_id: TenantId, request: ApiRequest) -> PendingOperation {
        let (operation, receiver) = QueuedOperation::new(request);

        let start = {
            let mut state = self
                .tenants
                .entry(tenant_id)
                .or_insert_with(|| self.new_state(tenant_id));
            state
                .push(operation)
                .then(|| (state.generation(), state.dispatch_lock()))
        };

        if let Some((generation, dispatch)) = start {
            let supervisor = Arc::clone(self);
            tokio::spawn(supervisor.drain(tenant_id, generation, dispatch));
        }

        PendingOperation {
            tenant_id,
            receiver,
        }
    }

    /// Enqueue and wait for the result
    pub async fn execute(self: &Arc<Self>, tenant_id: TenantId, request: ApiRequest) -> OperationResult {
        self.enqueue(tenant_id, request).await
    }

    /// Enqueue with a deadline. On expiry the operation leaves the queue
    /// without disturbing its neighbours and `Timeout` is returned.
    pub async fn execute_with_deadline(
        self: &Arc<Self>,
        tenant_id: TenantId,
        request: ApiRequest,
        deadline: Duration,
    ) -> OperationResult {
        let pending = self.enqueue(tenant_id, request);
        match timeout(deadline, pending).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(mut state) = self.tenants.get_mut(&tenant_id) {
                    state.purge_abandoned();
                }
                debug!("Tenant {tenant_id}: operation timed out after {deadline:?}");
                Err(GovernanceError::Timeout(deadline))
            }
        }
    }

    pub fn tenant_status(&self) -> Vec<TenantQueueStatus> {
        let now = Instant::now();
        let mut tenants: Vec<TenantQueueStatus> =
            self.tenants.iter().map(|entry| entry.value().status(now)).collect();
        tenants.sort_by_key(|t| t.tenant_id);
        tenants
    }

    pub async fn status(&self) -> GovernanceStatus {
        GovernanceStatus {
            governor: self.governor.status().await,
            tenants: self.tenant_status(),
        }
    }

    /// Single consumer for one tenant's queue. Exits when the queue runs dry,
    /// or when the tenant is removed (or replaced by a newer generation).
    async fn drain(self: Arc<Self>, tenant_id: TenantId, generation: u64, dispatch: Arc<Mutex<()>>) {
        self.drain_queue(tenant_id, generation, &dispatch).await;
        // nothing of this generation is in flight any more
        self.retired
            .remove_if(&tenant_id, |_, lock| Arc::ptr_eq(lock, &dispatch));
    }

    async fn drain_queue(&self, tenant_id: TenantId, generation: u64, dispatch: &Mutex<()>) {
        loop {
            let (operation, wait) = {
                let Some(mut state) = self.tenants.get_mut(&tenant_id) else {
                    return;
                };
                if state.generation() != generation {
                    return;
                }
                match state.pop_next() {
                    Some(operation) => {
                        let wait = state.pacing_delay(Instant::now(), self.config.pacing);
                        (operation, wait)
                    }
                    None => return,
                }
            };

            if !wait.is_zero() {
                sleep(wait).await;
            }

            // a removed generation may still have its last call in flight
            let _in_flight = dispatch.lock().await;

            // the tenant may have gone away while we were waiting
            let dispatched = match self.tenants.get_mut(&tenant_id) {
                Some(mut state) if state.generation() == generation => {
                    state.mark_dispatched(Instant::now());
                    true
                }
                _ => false,
            };
            if !dispatched {
                operation.resolve(Err(GovernanceError::TenantRemoved(tenant_id)));
                return;
            }

            let (request, mut completion) = operation.into_parts();
            let label = request.to_string();
            let governor = Arc::clone(&self.governor);
            // own task, so a panicking transport fails this operation only
            let mut call = tokio::spawn(async move { governor.submit(request).await });
            let result = tokio::select! {
                joined = &mut call => joined.unwrap_or_else(|e| {
                    error!("Tenant {tenant_id}: {label} aborted: {e}");
                    Err(GovernanceError::Transport {
                        status: None,
                        message: format!("dispatch aborted: {e}"),
                    })
                }),
                _ = completion.closed() => {
                    debug!("Tenant {tenant_id}: caller gave up on {label}");
                    call.abort();
                    let _ = call.await;
                    self.governor.purge_abandoned().await;
                    continue;
                }
            };

            if let Err(e) = &result {
                warn!("Tenant {tenant_id}: {label} failed: {e}");
            }
            // the caller may have stopped listening; nothing to do then
            let _ = completion.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::rate_limiting::GovernorConfig;
    use crate::features::tenant_queue::DrainState;
    use crate::transport::testing::{ScriptedTransport, Step};

    fn supervisor_with(transport: Arc<ScriptedTransport>, pacing: Duration) -> Arc<QueueSupervisor> {
        let governor = GlobalRateGovernor::new(GovernorConfig::default(), transport);
        QueueSupervisor::new(governor, TenantQueueConfig { pacing })
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_tenant_runs_in_order_despite_failure() {
        let transport = Arc::new(ScriptedTransport::new().script("/t/1", vec![Step::Fail(500)]));
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(1);

        let op1 = supervisor.enqueue(tenant, ApiRequest::get("/t/1"));
        let op2 = supervisor.enqueue(tenant, ApiRequest::get("/t/2"));
        let op3 = supervisor.enqueue(tenant, ApiRequest::get("/t/3"));

        assert!(matches!(op1.await, Err(GovernanceError::Transport { status: Some(500), .. })));
        assert!(op2.await.is_ok());
        assert!(op3.await.is_ok());
        assert_eq!(transport.calls(), vec!["/t/1", "/t/2", "/t/3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_same_tenant_dispatches() {
        let transport = Arc::new(ScriptedTransport::new());
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(7);

        let pending: Vec<_> = (0..4)
            .map(|i| supervisor.enqueue(tenant, ApiRequest::get(format!("/p/{i}"))))
            .collect();
        for op in pending {
            op.await.unwrap();
        }

        let instants = transport.call_instants();
        for pair in instants.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_in_flight_per_tenant() {
        let transport =
            Arc::new(ScriptedTransport::new().delay_prefix("/slow", Duration::from_millis(50)));
        let supervisor = supervisor_with(transport.clone(), Duration::ZERO);
        let tenant = TenantId(3);

        let pending: Vec<_> = (0..5)
            .map(|i| supervisor.enqueue(tenant, ApiRequest::get(format!("/slow/{i}"))))
            .collect();
        for op in pending {
            op.await.unwrap();
        }

        // each call starts only after the previous one finished
        let instants = transport.call_instants();
        for pair in instants.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tenant_does_not_block_others() {
        let transport =
            Arc::new(ScriptedTransport::new().delay_prefix("/slow", Duration::from_secs(10)));
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let slow = TenantId(1);
        let fast = TenantId(2);
        let start = Instant::now();

        let slow_ops: Vec<_> = (0..2)
            .map(|i| supervisor.enqueue(slow, ApiRequest::get(format!("/slow/{i}"))))
            .collect();
        let fast_ops: Vec<_> = (0..3)
            .map(|i| supervisor.enqueue(fast, ApiRequest::get(format!("/fast/{i}"))))
            .collect();

        for op in fast_ops {
            op.await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let status = supervisor.tenant_status();
        let slow_status = status.iter().find(|t| t.tenant_id == slow).unwrap();
        assert!(slow_status.draining);
        assert_eq!(slow_status.pending, 1);

        for op in slow_ops {
            op.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_fails_queued_operations() {
        let transport = Arc::new(ScriptedTransport::new());
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(5);

        let pending: Vec<_> = (0..3)
            .map(|i| supervisor.enqueue(tenant, ApiRequest::get(format!("/gone/{i}"))))
            .collect();
        assert_eq!(supervisor.on_tenant_removed(tenant), 3);

        for op in pending {
            assert_eq!(op.await, Err(GovernanceError::TenantRemoved(tenant)));
        }
        assert!(transport.calls().is_empty());
        assert_eq!(supervisor.tenant_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_lets_in_flight_operation_finish() {
        let transport =
            Arc::new(ScriptedTransport::new().delay_prefix("/busy", Duration::from_millis(500)));
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(6);

        let first = supervisor.enqueue(tenant, ApiRequest::get("/busy/0"));
        let second = supervisor.enqueue(tenant, ApiRequest::get("/busy/1"));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(supervisor.on_tenant_removed(tenant), 1);
        assert_eq!(second.await, Err(GovernanceError::TenantRemoved(tenant)));
        assert!(supervisor.retired.contains_key(&tenant));
        assert!(first.await.is_ok());
        assert_eq!(transport.calls(), vec!["/busy/0"]);

        sleep(Duration::from_millis(1)).await;
        assert!(supervisor.retired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_tenant_waits_for_previous_in_flight_call() {
        let transport =
            Arc::new(ScriptedTransport::new().delay_prefix("/busy", Duration::from_millis(500)));
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(10);

        let old = supervisor.enqueue(tenant, ApiRequest::get("/busy/old"));
        sleep(Duration::from_millis(10)).await;
        supervisor.on_tenant_removed(tenant);
        assert!(supervisor.on_tenant_added(tenant));
        let new = supervisor.enqueue(tenant, ApiRequest::get("/busy/new"));

        assert!(old.await.is_ok());
        assert!(new.await.is_ok());
        assert_eq!(transport.calls(), vec!["/busy/old", "/busy/new"]);
        let instants = transport.call_instants();
        assert!(instants[1].duration_since(instants[0]) >= Duration::from_millis(500));
        assert!(supervisor.retired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_panic_fails_only_that_operation() {
        let transport = Arc::new(ScriptedTransport::new().script("/crash", vec![Step::Panic]));
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(11);

        let first = supervisor.enqueue(tenant, ApiRequest::get("/crash"));
        let second = supervisor.enqueue(tenant, ApiRequest::get("/after"));
        assert!(matches!(first.await, Err(GovernanceError::Transport { status: None, .. })));
        assert!(second.await.is_ok());

        let later = timeout(Duration::from_secs(5), supervisor.execute(tenant, ApiRequest::get("/later")))
            .await
            .unwrap();
        assert!(later.is_ok());

        sleep(Duration::from_millis(1)).await;
        let status = supervisor.tenant_status();
        assert_eq!(status.len(), 1);
        assert!(!status[0].draining);
        assert_eq!(status[0].pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_queued_operation() {
        let transport =
            Arc::new(ScriptedTransport::new().delay_prefix("/hold", Duration::from_secs(1)));
        let supervisor = supervisor_with(transport.clone(), Duration::ZERO);
        let tenant = TenantId(8);

        let blocker = supervisor.enqueue(tenant, ApiRequest::get("/hold/0"));
        let result = supervisor
            .execute_with_deadline(tenant, ApiRequest::get("/hold/late"), Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(GovernanceError::Timeout(Duration::from_millis(100))));

        let after = supervisor.enqueue(tenant, ApiRequest::get("/after"));
        assert!(blocker.await.is_ok());
        assert!(after.await.is_ok());
        assert_eq!(transport.calls(), vec!["/hold/0", "/after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenant_added_creates_idle_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let supervisor = supervisor_with(transport, Duration::from_millis(100));

        assert!(supervisor.on_tenant_added(TenantId(2)));
        assert!(supervisor.on_tenant_added(TenantId(1)));
        assert!(!supervisor.on_tenant_added(TenantId(1)));
        assert_eq!(supervisor.tenant_count(), 2);

        let status = supervisor.status().await;
        assert_eq!(status.tenants.len(), 2);
        assert_eq!(status.tenants[0].tenant_id, TenantId(1));
        assert!(status.tenants.iter().all(|t| t.pending == 0 && !t.draining));
        assert_eq!(status.governor.pending, 0);

        let state = supervisor.tenants.get(&TenantId(1)).unwrap();
        assert_eq!(state.drain_state(), DrainState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_tenant_gets_fresh_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let supervisor = supervisor_with(transport.clone(), Duration::from_millis(100));
        let tenant = TenantId(4);

        let old = supervisor.enqueue(tenant, ApiRequest::get("/old"));
        supervisor.on_tenant_removed(tenant);
        assert!(supervisor.on_tenant_added(tenant));

        let new = supervisor.execute(tenant, ApiRequest::get("/new")).await;
        assert!(new.is_ok());
        assert_eq!(old.await, Err(GovernanceError::TenantRemoved(tenant)));
        assert_eq!(transport.calls(), vec!["/new"]);
    }
}

//! Per-tenant queue state.
//!
//! Plain data guarded by the supervisor's map; nothing here awaits. The
//! drain loop that consumes it lives in the supervisor.

use crate::core::error::GovernanceError;
use crate::core::status::TenantQueueStatus;
use crate::core::types::TenantId;
use crate::transport::{ApiRequest, ApiResponse};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Outcome delivered to whoever enqueued an operation
pub type OperationResult = Result<ApiResponse, GovernanceError>;

/// One unit of deferred work and the slot its result goes into
pub struct QueuedOperation {
    pub request: ApiRequest,
    pub enqueued_at: Instant,
    completion: oneshot::Sender<OperationResult>,
}

impl QueuedOperation {
    pub fn new(request: ApiRequest) -> (Self, oneshot::Receiver<OperationResult>) {
        let (completion, receiver) = oneshot::channel();
        let operation = QueuedOperation {
            request,
            enqueued_at: Instant::now(),
            completion,
        };
        (operation, receiver)
    }

    /// The caller stopped waiting (deadline or dropped future)
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Resolve the completion. Returns false if nobody was listening.
    pub fn resolve(self, result: OperationResult) -> bool {
        self.completion.send(result).is_ok()
    }

    pub fn into_parts(self) -> (ApiRequest, oneshot::Sender<OperationResult>) {
        (self.request, self.completion)
    }
}

/// Drain lifecycle of a tenant queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
}

pub struct TenantQueueState {
    tenant_id: TenantId,
    /// Distinguishes a re-added tenant from the one that was removed
    generation: u64,
    pending: VecDeque<QueuedOperation>,
    draining: bool,
    last_dispatch_at: Option<Instant>,
    /// Held for the duration of each dispatch. Shared with a re-added
    /// generation while the removed one still has a call in flight.
    dispatch: Arc<Mutex<()>>,
}

impl TenantQueueState {
    pub fn new(tenant_id: TenantId, generation: u64, dispatch: Arc<Mutex<()>>) -> Self {
        TenantQueueState {
            tenant_id,
            generation,
            pending: VecDeque::new(),
            draining: false,
            last_dispatch_at: None,
            dispatch,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dispatch_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.dispatch)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain_state(&self) -> DrainState {
        if self.draining {
            DrainState::Draining
        } else {
            DrainState::Idle
        }
    }

    /// Append an operation. Returns true when the caller has to start the
    /// drain loop (the queue was idle).
    pub fn push(&mut self, operation: QueuedOperation) -> bool {
        self.pending.push_back(operation);
        if self.draining {
            false
        } else {
            self.draining = true;
            true
        }
    }

    /// Next live operation in FIFO order. Goes idle when nothing is left.
    pub fn pop_next(&mut self) -> Option<QueuedOperation> {
        while let Some(operation) = self.pending.pop_front() {
            if !operation.is_abandoned() {
                return Some(operation);
            }
        }
        self.draining = false;
        None
    }

    /// How long to hold the next operation to keep `pacing` between dispatches
    pub fn pacing_delay(&self, now: Instant, pacing: Duration) -> Duration {
        match self.last_dispatch_at {
            Some(last) => pacing.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn mark_dispatched(&mut self, now: Instant) {
        self.last_dispatch_at = Some(now);
    }

    /// Drop operations whose callers gave up, keeping the rest in order
    pub fn purge_abandoned(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|operation| !operation.is_abandoned());
        before - self.pending.len()
    }

    /// Fail everything still queued; used when the tenant goes away
    pub fn fail_all(self) -> usize {
        let tenant_id = self.tenant_id;
        self.pending
            .into_iter()
            .map(|operation| operation.resolve(Err(GovernanceError::TenantRemoved(tenant_id))))
            .filter(|delivered| *delivered)
            .count()
    }

    pub fn status(&self, now: Instant) -> TenantQueueStatus {
        TenantQueueStatus {
            tenant_id: self.tenant_id,
            pending: self.pending.len(),
            draining: self.draining,
            oldest_pending_ms: self
                .pending
                .front()
                .map(|op| now.duration_since(op.enqueued_at).as_millis() as u64),
        }
    }
}

//! Read-only observability snapshots for the status command and dashboard.

use crate::core::types::TenantId;
use serde::{Deserialize, Serialize};

/// Snapshot of the global rate governor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorStatus {
    /// Operations waiting for admission
    pub pending: usize,
    /// Admissions counted in the current window
    pub requests_used: u32,
    pub requests_remaining: u32,
    pub max_requests: u32,
    pub window_ms: u64,
    /// Time until the oldest admission leaves the window (0 when idle)
    pub window_remaining_ms: u64,
    /// Set while a global rate limit has paused all admissions
    pub paused_for_ms: Option<u64>,
    pub total_admitted: u64,
    pub total_rate_limited: u64,
    pub total_failed: u64,
}

/// Snapshot of one tenant queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQueueStatus {
    pub tenant_id: TenantId,
    pub pending: usize,
    pub draining: bool,
    /// Age of the oldest queued operation
    pub oldest_pending_ms: Option<u64>,
}

/// Aggregate status across the governance layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceStatus {
    pub governor: GovernorStatus,
    pub tenants: Vec<TenantQueueStatus>,
}

impl GovernanceStatus {
    /// Total operations queued across every tenant
    pub fn tenant_backlog(&self) -> usize {
        self.tenants.iter().map(|t| t.pending).sum()
    }

    /// Tenants with an operation currently in flight
    pub fn draining_tenants(&self) -> usize {
        self.tenants.iter().filter(|t| t.draining).count()
    }
}

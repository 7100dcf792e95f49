//! # Features
//!
//! Each feature owns one concern of the governance layer:
//!
//! - `rate_limiting`: process-wide admission against the shared API budget
//! - `tenant_queue`: ordered per-guild queues feeding the governor
//! - `dedup`: time-windowed suppression of repeated events
//! - `audit`: duplicate-suppressed audit log and live feed

pub mod audit;
pub mod dedup;
pub mod rate_limiting;
pub mod tenant_queue;

pub use audit::{
    AuditAction, AuditBroadcaster, AuditEntry, AuditRecord, AuditStore, JsonlAuditStore,
    MemoryAuditStore,
};
pub use dedup::{DedupConfig, EventDeduplicator, EventSignature};
pub use rate_limiting::{GlobalRateGovernor, GovernorConfig};
pub use tenant_queue::{PendingOperation, QueueSupervisor, TenantQueueConfig};

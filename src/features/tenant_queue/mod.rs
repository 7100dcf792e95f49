//! # Tenant Queue Feature
//!
//! Strictly ordered, one-at-a-time operation queues per guild, drained into
//! the global rate governor.
//!
//! - **Version**: 1.2.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false

pub mod queue;
pub mod supervisor;

pub use queue::{DrainState, OperationResult, QueuedOperation, TenantQueueState};
pub use supervisor::{PendingOperation, QueueSupervisor, TenantQueueConfig};

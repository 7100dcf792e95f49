// Core layer - shared types, configuration and errors
pub mod core;

// Transport layer - the remote API seam
pub mod transport;

// Features layer - rate governance, tenant queues, dedup, audit
pub mod features;

// Application layer
pub mod commands;

// IPC layer - communication between bot and dashboards
pub mod ipc;

// Re-export core items
pub use core::{Config, GovernanceError, GovernanceStatus, TenantId};

// Re-export feature items
pub use features::{
    // Audit
    AuditAction, AuditBroadcaster, AuditEntry, AuditRecord, AuditStore, JsonlAuditStore,
    MemoryAuditStore,
    // Dedup
    DedupConfig, EventDeduplicator, EventSignature,
    // Rate limiting
    GlobalRateGovernor, GovernorConfig,
    // Tenant queues
    PendingOperation, QueueSupervisor, TenantQueueConfig,
};

// Re-export transport items
pub use transport::{ApiRequest, ApiResponse, DiscordHttpTransport, Method, Transport, TransportError};

// Re-export IPC items
pub use ipc::{BotEvent, DashboardCommand, IpcClient, IpcServer};

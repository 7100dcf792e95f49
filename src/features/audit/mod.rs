//! # Audit Feature
//!
//! Duplicate-suppressed audit log with a live broadcast feed.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false

pub mod broadcaster;
pub mod store;

pub use broadcaster::{
    AuditAction, AuditBroadcaster, AuditEntry, AuditRecord, AuditSignature,
    DuplicateSignatureCache,
};
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};

//! # Core Module
//!
//! Shared types, configuration, error taxonomy and status snapshots.
//!
//! - **Version**: 1.2.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.2.0: Add status snapshot types for the dashboard feed
//! - 1.1.0: Add governance error taxonomy
//! - 1.0.0: Initial creation with config module

pub mod config;
pub mod error;
pub mod status;
pub mod types;

// Re-export commonly used items
pub use config::{Config, GovernanceOverrides};
pub use error::GovernanceError;
pub use status::{GovernanceStatus, GovernorStatus, TenantQueueStatus};
pub use types::TenantId;

//! # Governance Errors
//!
//! Failure type carried by every operation's completion.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//!
//! ## Changelog
//! - 1.1.0: Added `RetriesExhausted` and `Timeout` for capped retries and deadlines
//! - 1.0.0: Initial taxonomy (transport failure, tenant removed)

use crate::core::types::TenantId;
use std::time::Duration;
use thiserror::Error;

/// Why a governed operation did not produce a response.
///
/// Rate limits are retried inside the governor; they only surface here as
/// `RetriesExhausted` when a retry cap is configured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovernanceError {
    /// The transport reported a non-rate-limit failure (network, 4xx, 5xx).
    #[error("transport failure ({}): {message}", status.map(|s| s.to_string()).unwrap_or_else(|| "no status".to_string()))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The tenant was removed before the operation was attempted.
    #[error("tenant {0} was removed before the operation ran")]
    TenantRemoved(TenantId),

    /// The operation kept getting rate limited past the configured cap.
    #[error("gave up after {attempts} rate-limited attempts")]
    RetriesExhausted { attempts: u32 },

    /// The operation's deadline expired before it completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The governor went away while the operation was waiting for admission.
    #[error("rate governor is shut down")]
    Closed,
}

impl GovernanceError {
    /// True when the remote service actually saw (and rejected) the request.
    pub fn is_remote_rejection(&self) -> bool {
        matches!(self, GovernanceError::Transport { status: Some(_), .. })
    }
}

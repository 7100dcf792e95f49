//! # IPC Protocol
//!
//! Message types for bot <-> dashboard communication over Unix socket.
//!
//! Uses length-prefixed JSON framing:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON payload

use crate::core::status::GovernanceStatus;
use crate::core::types::TenantId;
use crate::features::audit::AuditRecord;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames larger than this are treated as a broken peer
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

// ============================================================================
// Bot -> Dashboard Events
// ============================================================================

/// Events sent from the bot to connected dashboard clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BotEvent {
    /// Governance snapshot (response to GetStatus)
    GovernanceStatus { status: GovernanceStatus },
    /// An audit entry was recorded
    AuditLogged { record: AuditRecord },
    /// Recent audit entries for one tenant (response to GetRecentAudit)
    RecentAudit {
        tenant_id: TenantId,
        records: Vec<AuditRecord>,
    },
    /// A command could not be served
    CommandFailed { message: String },
    /// Heartbeat to keep connection alive
    Heartbeat { timestamp: i64 },
}

// ============================================================================
// Dashboard -> Bot Commands
// ============================================================================

/// Commands sent from dashboard clients to the bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardCommand {
    /// Request the current governance snapshot
    GetStatus,
    /// Request the latest audit entries of a tenant
    GetRecentAudit { tenant_id: TenantId, limit: usize },
    /// Heartbeat response
    Pong { timestamp: i64 },
}

// ============================================================================
// Framing - Length-prefixed JSON messages
// ============================================================================

/// Encode a message with length prefix
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

fn check_len(len_buf: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes", len));
    }
    Ok(len)
}

/// Read one raw frame from an async stream. `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = check_len(len_buf)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

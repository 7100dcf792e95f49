//! /governor command: renders the governance status snapshot
//!
//! - **Version**: 1.0.0
//! - **Since**: 1.1.0

use crate::core::status::{GovernanceStatus, TenantQueueStatus};
use crate::core::types::TenantId;
use crate::features::tenant_queue::{OperationResult, QueueSupervisor};
use crate::transport::ApiRequest;
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;

/// Tenant rows shown before the list is cut short
const MAX_TENANT_LINES: usize = 10;

/// CHANNEL_MESSAGE_WITH_SOURCE
const REPLY_WITH_MESSAGE: u8 = 4;

/// EPHEMERAL
const EPHEMERAL_FLAG: u64 = 1 << 6;

/// Render the status snapshot as a chat message
pub fn format_status_message(status: &GovernanceStatus) -> String {
    let governor = &status.governor;
    let mut out = String::new();

    out.push_str("**Rate Governor**\n");
    let _ = writeln!(
        out,
        "Window: {}/{} used ({} remaining), {} ms window",
        governor.requests_used, governor.max_requests, governor.requests_remaining, governor.window_ms
    );
    if governor.window_remaining_ms > 0 {
        let _ = writeln!(out, "Next slot frees in {} ms", governor.window_remaining_ms);
    }
    let _ = writeln!(out, "Waiting for admission: {}", governor.pending);
    if let Some(paused) = governor.paused_for_ms {
        let _ = writeln!(out, "Paused by global rate limit for {paused} ms");
    }
    let _ = writeln!(
        out,
        "Totals: {} admitted, {} rate limited, {} failed",
        governor.total_admitted, governor.total_rate_limited, governor.total_failed
    );

    let _ = write!(
        out,
        "\n**Tenant Queues** ({} tenants, {} draining, {} queued)",
        status.tenants.len(),
        status.draining_tenants(),
        status.tenant_backlog()
    );

    // busiest first
    let mut busy: Vec<&TenantQueueStatus> = status
        .tenants
        .iter()
        .filter(|t| t.pending > 0 || t.draining)
        .collect();
    busy.sort_by(|a, b| b.pending.cmp(&a.pending));

    for tenant in busy.iter().take(MAX_TENANT_LINES) {
        let _ = write!(out, "\n`{}`: {} queued", tenant.tenant_id, tenant.pending);
        if tenant.draining {
            out.push_str(", draining");
        }
        if let Some(age) = tenant.oldest_pending_ms {
            let _ = write!(out, ", oldest {age} ms");
        }
    }
    if busy.len() > MAX_TENANT_LINES {
        let _ = write!(out, "\n...and {} more", busy.len() - MAX_TENANT_LINES);
    }

    out
}

/// Ephemeral interaction reply carrying `content`
pub fn interaction_reply(interaction_id: u64, token: &str, content: &str) -> ApiRequest {
    ApiRequest::post(
        format!("/interactions/{interaction_id}/{token}/callback"),
        json!({
            "type": REPLY_WITH_MESSAGE,
            "data": {
                "content": content,
                "flags": EPHEMERAL_FLAG,
            }
        }),
    )
}

/// Answer a /governor invocation. The reply itself goes through the
/// invoking tenant's queue.
pub async fn respond_with_status(
    supervisor: &Arc<QueueSupervisor>,
    tenant_id: TenantId,
    interaction_id: u64,
    token: &str,
) -> OperationResult {
    let status = supervisor.status().await;
    let content = format_status_message(&status);
    supervisor
        .execute(tenant_id, interaction_reply(interaction_id, token, &content))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::GovernorStatus;
    use crate::features::rate_limiting::{GlobalRateGovernor, GovernorConfig};
    use crate::features::tenant_queue::TenantQueueConfig;
    use crate::transport::testing::ScriptedTransport;

    fn governor_status() -> GovernorStatus {
        GovernorStatus {
            pending: 3,
            requests_used: 12,
            requests_remaining: 38,
            max_requests: 50,
            window_ms: 1000,
            window_remaining_ms: 420,
            paused_for_ms: None,
            total_admitted: 1042,
            total_rate_limited: 4,
            total_failed: 1,
        }
    }

    fn tenant(id: u64, pending: usize, draining: bool) -> TenantQueueStatus {
        TenantQueueStatus {
            tenant_id: TenantId(id),
            pending,
            draining,
            oldest_pending_ms: (pending > 0).then_some(250),
        }
    }

    #[test]
    fn test_format_governor_section() {
        let status = GovernanceStatus {
            governor: governor_status(),
            tenants: vec![],
        };
        let message = format_status_message(&status);

        assert!(message.contains("Window: 12/50 used (38 remaining)"));
        assert!(message.contains("Next slot frees in 420 ms"));
        assert!(message.contains("Waiting for admission: 3"));
        assert!(message.contains("1042 admitted, 4 rate limited, 1 failed"));
        assert!(!message.contains("Paused"));
        assert!(message.contains("(0 tenants, 0 draining, 0 queued)"));
    }

    #[test]
    fn test_format_shows_global_pause() {
        let mut governor = governor_status();
        governor.paused_for_ms = Some(1200);
        let status = GovernanceStatus {
            governor,
            tenants: vec![],
        };
        assert!(format_status_message(&status).contains("Paused by global rate limit for 1200 ms"));
    }

    #[test]
    fn test_format_lists_busiest_tenants_only() {
        let status = GovernanceStatus {
            governor: governor_status(),
            tenants: vec![tenant(1, 0, false), tenant(2, 1, true), tenant(3, 5, true)],
        };
        let message = format_status_message(&status);

        assert!(message.contains("(3 tenants, 2 draining, 6 queued)"));
        assert!(!message.contains("`1`"));
        let three = message.find("`3`: 5 queued, draining, oldest 250 ms").unwrap();
        let two = message.find("`2`: 1 queued").unwrap();
        assert!(three < two);
    }

    #[test]
    fn test_format_truncates_long_tenant_list() {
        let tenants = (1..=15).map(|id| tenant(id, 1, true)).collect();
        let status = GovernanceStatus {
            governor: governor_status(),
            tenants,
        };
        assert!(format_status_message(&status).ends_with("...and 5 more"));
    }

    #[test]
    fn test_interaction_reply_is_ephemeral() {
        let request = interaction_reply(99, "tok", "hello");
        assert_eq!(request.route, "/interactions/99/tok/callback");
        let body = request.body.unwrap();
        assert_eq!(body["type"], 4);
        assert_eq!(body["data"]["content"], "hello");
        assert_eq!(body["data"]["flags"], 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_with_status_replies_through_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let governor = GlobalRateGovernor::new(GovernorConfig::default(), transport.clone());
        let supervisor = QueueSupervisor::new(governor, TenantQueueConfig::default());

        let result = respond_with_status(&supervisor, TenantId(5), 99, "tok").await;
        assert!(result.is_ok());

        let body = transport.last_body("/interactions/99/tok/callback").unwrap();
        let content = body["data"]["content"].as_str().unwrap();
        assert!(content.contains("**Rate Governor**"));
        assert_eq!(supervisor.tenant_status()[0].tenant_id, TenantId(5));
    }
}

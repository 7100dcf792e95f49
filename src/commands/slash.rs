//! Guild slash command definitions and per-tenant registration.
//!
//! Registration is a bulk overwrite of the guild's command set, sent through
//! the tenant queue like any other outbound call.

use crate::core::types::TenantId;
use crate::features::tenant_queue::{PendingOperation, QueueSupervisor};
use crate::transport::ApiRequest;
use serde_json::{json, Value};
use std::sync::Arc;

pub const GOVERNOR_COMMAND: &str = "governor";

/// MANAGE_GUILD
const ADMIN_PERMISSIONS: u64 = 1 << 5;

/// CHAT_INPUT
const SLASH_COMMAND_KIND: u8 = 1;

/// Creates all guild command definitions
pub fn create_guild_commands() -> Vec<Value> {
    vec![create_governor_command()]
}

/// Creates the governor command (admin) - rate governor and queue status
fn create_governor_command() -> Value {
    json!({
        "name": GOVERNOR_COMMAND,
        "type": SLASH_COMMAND_KIND,
        "description": "Show outbound rate limit and queue status (Admin)",
        "default_member_permissions": ADMIN_PERMISSIONS.to_string(),
        "dm_permission": false,
    })
}

pub fn guild_commands_route(application_id: u64, tenant_id: TenantId) -> String {
    format!("/applications/{application_id}/guilds/{tenant_id}/commands")
}

/// Queue a bulk overwrite of the tenant's slash commands
pub fn register_guild_commands(
    supervisor: &Arc<QueueSupervisor>,
    application_id: u64,
    tenant_id: TenantId,
) -> PendingOperation {
    let request = ApiRequest::put(
        guild_commands_route(application_id, tenant_id),
        Value::Array(create_guild_commands()),
    );
    supervisor.enqueue(tenant_id, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::rate_limiting::{GlobalRateGovernor, GovernorConfig};
    use crate::features::tenant_queue::TenantQueueConfig;
    use crate::transport::testing::ScriptedTransport;

    #[test]
    fn test_commands_have_unique_names() {
        let commands = create_guild_commands();
        let mut names: Vec<&str> = commands
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), commands.len());
    }

    #[test]
    fn test_governor_command_is_admin_only() {
        let command = create_governor_command();
        assert_eq!(command["name"], GOVERNOR_COMMAND);
        assert_eq!(command["default_member_permissions"], "32");
        assert_eq!(command["dm_permission"], false);
    }

    #[test]
    fn test_route() {
        assert_eq!(
            guild_commands_route(10, TenantId(20)),
            "/applications/10/guilds/20/commands"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_goes_through_tenant_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let governor = GlobalRateGovernor::new(GovernorConfig::default(), transport.clone());
        let supervisor = QueueSupervisor::new(governor, TenantQueueConfig::default());
        supervisor.on_tenant_added(TenantId(20));

        let pending = register_guild_commands(&supervisor, 10, TenantId(20));
        assert_eq!(pending.tenant_id(), TenantId(20));
        assert!(pending.await.is_ok());

        let route = "/applications/10/guilds/20/commands";
        assert_eq!(transport.call_count(route), 1);
        let body = transport.last_body(route).unwrap();
        assert_eq!(body.as_array().unwrap().len(), create_guild_commands().len());
    }
}

use anyhow::Result;
use dotenvy::dotenv;
use log::{debug, error, info, warn};
use serenity::async_trait;
use serenity::model::application::interaction::Interaction;
use serenity::model::channel::Reaction;
use serenity::model::gateway::Ready;
use serenity::model::guild::{Guild, UnavailableGuild};
use serenity::model::id::GuildId;
use serenity::model::user::User;
use serenity::prelude::*;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gatekeeper::commands::{register_guild_commands, respond_with_status, GOVERNOR_COMMAND};
use gatekeeper::core::{Config, TenantId};
use gatekeeper::features::audit::{
    AuditAction, AuditBroadcaster, AuditEntry, AuditStore, JsonlAuditStore, MemoryAuditStore,
};
use gatekeeper::features::dedup::EventDeduplicator;
use gatekeeper::features::rate_limiting::GlobalRateGovernor;
use gatekeeper::features::tenant_queue::QueueSupervisor;
use gatekeeper::ipc::{get_socket_path, IpcServer};
use gatekeeper::transport::DiscordHttpTransport;

/// Guild commands are re-registered at most this often per guild
const REGISTRATION_WINDOW: Duration = Duration::from_secs(600);

/// Gateway ban events do not name the moderator
const UNKNOWN_ACTOR: u64 = 0;

struct Handler {
    supervisor: Arc<QueueSupervisor>,
    deduplicator: Arc<EventDeduplicator>,
    audit: Arc<AuditBroadcaster>,
    application_id: OnceLock<u64>,
}

impl Handler {
    /// Queue a bulk overwrite of the guild's commands unless one went out recently
    fn register_commands(&self, tenant_id: TenantId) {
        let Some(&application_id) = self.application_id.get() else {
            warn!("Guild {tenant_id} available before ready; skipping command registration");
            return;
        };
        if self
            .deduplicator
            .is_duplicate("guild_commands", &tenant_id.to_string(), Some(REGISTRATION_WINDOW))
        {
            debug!("Commands for guild {tenant_id} registered recently");
            return;
        }

        let pending = register_guild_commands(&self.supervisor, application_id, tenant_id);
        let audit = self.audit.clone();
        let deduplicator = self.deduplicator.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(_) => {
                    info!("Registered guild commands for {tenant_id}");
                    let entry =
                        AuditEntry::new(tenant_id, AuditAction::CommandsRegistered, application_id);
                    if let Err(e) = audit.log(entry).await {
                        warn!("Failed to record command registration: {e:#}");
                    }
                }
                Err(e) if e.is_remote_rejection() => {
                    // Discord refused (e.g. missing scope); retrying before the window ends won't help
                    error!("Discord rejected command registration for {tenant_id}: {e}");
                }
                Err(e) => {
                    error!("Failed to register guild commands for {tenant_id}: {e}");
                    // allow the next guild_create to try again
                    deduplicator.forget("guild_commands", &tenant_id.to_string());
                }
            }
        });
    }

    async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.log(entry).await {
            error!("Failed to record audit entry: {e:#}");
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("{} is connected and ready!", ready.user.name);
        info!("Connected to {} guilds", ready.guilds.len());

        if let Some(shard) = ready.shard {
            info!("Shard: {}/{}", shard[0] + 1, shard[1]);
        }

        if self.application_id.set(ready.application.id.0).is_err() {
            debug!("Application id already known (reconnect)");
        }

        for guild in &ready.guilds {
            self.supervisor.on_tenant_added(TenantId(guild.id.0));
        }
        info!("Tracking {} guild queues", self.supervisor.tenant_count());
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: bool) {
        if is_new {
            info!("Joined new guild: {} ({})", guild.name, guild.id);
        } else {
            debug!("Guild available: {} ({})", guild.name, guild.id);
        }

        let tenant_id = TenantId(guild.id.0);
        self.supervisor.on_tenant_added(tenant_id);
        self.register_commands(tenant_id);
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // an outage, not a removal
        if incomplete.unavailable {
            warn!("Guild {} became unavailable", incomplete.id);
            return;
        }

        let tenant_id = TenantId(incomplete.id.0);
        let failed = self.supervisor.on_tenant_removed(tenant_id);
        info!("Removed from guild {tenant_id} ({failed} queued operations failed)");
        if let Err(e) = self.audit.forget_tenant(tenant_id).await {
            warn!("Failed to release audit history for {tenant_id}: {e:#}");
        }
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
            return;
        };

        // the gateway replays events on resume
        let identifier = format!("{}:{}:{}", reaction.message_id, user_id, reaction.emoji);
        let entry = AuditEntry::new(TenantId(guild_id.0), AuditAction::ReactionAdd, user_id.0)
            .with_target(reaction.message_id.0)
            .with_details(serde_json::json!({
                "channel_id": reaction.channel_id.0,
                "emoji": reaction.emoji.to_string(),
            }));
        self.deduplicator
            .process("reaction_add", &identifier, None, || self.record(entry))
            .await;
    }

    async fn guild_ban_addition(&self, _ctx: Context, guild_id: GuildId, banned_user: User) {
        info!("User {} banned in guild {}", banned_user.id, guild_id);
        let entry = AuditEntry::new(TenantId(guild_id.0), AuditAction::Ban, UNKNOWN_ACTOR)
            .with_target(banned_user.id.0);
        self.record(entry).await;
    }

    async fn guild_ban_removal(&self, _ctx: Context, guild_id: GuildId, unbanned_user: User) {
        info!("User {} unbanned in guild {}", unbanned_user.id, guild_id);
        let entry = AuditEntry::new(TenantId(guild_id.0), AuditAction::Unban, UNKNOWN_ACTOR)
            .with_target(unbanned_user.id.0);
        self.record(entry).await;
    }

    async fn interaction_create(&self, _ctx: Context, interaction: Interaction) {
        let Interaction::ApplicationCommand(command) = interaction else {
            return;
        };
        let Some(guild_id) = command.guild_id else {
            return;
        };

        if command.data.name.as_str() != GOVERNOR_COMMAND {
            warn!("Unknown command: {}", command.data.name);
            return;
        }

        let tenant_id = TenantId(guild_id.0);
        info!("/{} invoked by {} in {}", GOVERNOR_COMMAND, command.user.id, tenant_id);
        if let Err(e) =
            respond_with_status(&self.supervisor, tenant_id, command.id.0, &command.token).await
        {
            error!("Failed to answer /{} in {}: {}", GOVERNOR_COMMAND, tenant_id, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let config = Config::from_env()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    info!("Starting gatekeeper...");
    info!(
        "Governor budget: {} requests per {:?}, tenant pacing {:?}",
        config.governor.max_requests_per_window, config.governor.window, config.tenant_queue.pacing
    );

    let transport = Arc::new(DiscordHttpTransport::new(
        &config.api_base_url,
        &config.discord_token,
    ));
    let governor = GlobalRateGovernor::new(config.governor.clone(), transport);
    let supervisor = QueueSupervisor::new(governor, config.tenant_queue.clone());

    let deduplicator = Arc::new(EventDeduplicator::new(config.dedup.clone()));
    deduplicator.start_sweeper();

    let store: Arc<dyn AuditStore> = match &config.audit_log_path {
        Some(path) => {
            info!("Audit entries will be appended to {path}");
            Arc::new(JsonlAuditStore::new(path))
        }
        None => {
            info!("AUDIT_LOG_PATH not set - audit entries kept in memory");
            Arc::new(MemoryAuditStore::new())
        }
    };
    let audit = Arc::new(AuditBroadcaster::new(store, &config.dedup));
    audit.start_sweeper();

    // Start IPC server for dashboard communication
    let ipc_server = Arc::new(IpcServer::new(
        get_socket_path(),
        supervisor.clone(),
        audit.clone(),
    ));
    match ipc_server.clone().start().await {
        Ok(()) => {
            ipc_server.start_heartbeat(Duration::from_secs(30));
            info!("IPC server started for dashboard communication");
        }
        Err(e) => error!("Failed to start IPC server: {e:#}. Dashboard will be unavailable."),
    }

    let handler = Handler {
        supervisor,
        deduplicator,
        audit,
        application_id: OnceLock::new(),
    };

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_BANS;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| {
            error!("Failed to create Discord client: {e}");
            anyhow::anyhow!("Client creation failed: {}", e)
        })?;

    info!("Establishing WebSocket connection to Discord gateway...");
    info!("Gateway intents: {intents:?}");

    if let Err(why) = client.start().await {
        error!("Gateway connection failed: {why:?}");
        return Err(anyhow::anyhow!(
            "Failed to establish gateway connection: {}",
            why
        ));
    }

    drop(ipc_server);
    Ok(())
}

//! # IPC Server
//!
//! Unix socket server feeding governance status and audit events to
//! dashboard clients.
//!
//! - **Version**: 2.0.0
//! - **Since**: 3.17.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.0.0: Serve governance status and forward audit entries; replies go to the asking client only
//! - 1.1.0: Added command processing support and shared state for guilds/bot info
//! - 1.0.0: Initial IPC implementation with Unix socket protocol

use crate::features::audit::AuditBroadcaster;
use crate::features::tenant_queue::QueueSupervisor;
use crate::ipc::protocol::{encode_message, read_frame, BotEvent, DashboardCommand};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

/// Maximum number of connected dashboard clients
const MAX_CLIENTS: usize = 10;

/// Broadcast channel capacity for events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Direct reply channel capacity per client
const REPLY_CHANNEL_CAPACITY: usize = 16;

/// Upper bound on audit records returned per query
const MAX_AUDIT_QUERY: usize = 100;

/// IPC Server handle for the bot
pub struct IpcServer {
    socket_path: PathBuf,
    /// Broadcast sender for events to all clients
    event_tx: broadcast::Sender<BotEvent>,
    supervisor: Arc<QueueSupervisor>,
    audit: Arc<AuditBroadcaster>,
    /// Connected client count
    client_count: Arc<RwLock<usize>>,
}

impl IpcServer {
    /// Create a new IPC server (does not start listening yet)
    pub fn new(
        socket_path: impl Into<PathBuf>,
        supervisor: Arc<QueueSupervisor>,
        audit: Arc<AuditBroadcaster>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        IpcServer {
            socket_path: socket_path.into(),
            event_tx,
            supervisor,
            audit,
            client_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Bind the socket and start accepting clients and forwarding audit
    /// entries in background tasks
    pub async fn start(self: Arc<Self>) -> Result<()> {
        // Remove a stale socket left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("failed to remove stale socket {}", self.socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!("IPC server listening on {}", self.socket_path.display());

        self.clone().start_audit_forwarder();

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let client_count = *server.client_count.read().await;
                        if client_count >= MAX_CLIENTS {
                            warn!("Maximum IPC clients reached ({}), rejecting connection", MAX_CLIENTS);
                            continue;
                        }

                        *server.client_count.write().await += 1;
                        info!("Dashboard client connected (total: {})", client_count + 1);

                        let server_clone = server.clone();
                        let client_count_ref = server.client_count.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server_clone.handle_client(stream).await {
                                debug!("Client handler ended: {}", e);
                            }
                            *client_count_ref.write().await -= 1;
                            info!("Dashboard client disconnected");
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept IPC connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    /// Push every recorded audit entry to connected clients
    fn start_audit_forwarder(self: Arc<Self>) -> JoinHandle<()> {
        let mut audit_rx = self.audit.subscribe();
        tokio::spawn(async move {
            loop {
                match audit_rx.recv().await {
                    Ok(record) => self.broadcast(BotEvent::AuditLogged { record }),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Audit forwarder lagged behind by {} entries", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Handle a connected client
    async fn handle_client(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (mut reader, writer) = stream.into_split();

        let event_rx = self.event_tx.subscribe();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let write_handle = tokio::spawn(write_events(writer, event_rx, reply_rx));

        while let Some(frame) = read_frame(&mut reader).await? {
            match serde_json::from_slice::<DashboardCommand>(&frame) {
                Ok(cmd) => {
                    debug!("Processing dashboard command: {:?}", cmd);
                    if let Some(reply) = self.process_command(cmd).await {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to parse command from client: {}", e);
                }
            }
        }

        write_handle.abort();
        Ok(())
    }

    /// Process a single dashboard command and build the reply for the asking client
    pub async fn process_command(&self, cmd: DashboardCommand) -> Option<BotEvent> {
        match cmd {
            DashboardCommand::GetStatus => Some(BotEvent::GovernanceStatus {
                status: self.supervisor.status().await,
            }),
            DashboardCommand::GetRecentAudit { tenant_id, limit } => {
                let limit = limit.min(MAX_AUDIT_QUERY);
                match self.audit.recent(tenant_id, limit).await {
                    Ok(records) => Some(BotEvent::RecentAudit { tenant_id, records }),
                    Err(e) => {
                        warn!("Failed to load audit entries for {}: {:#}", tenant_id, e);
                        Some(BotEvent::CommandFailed {
                            message: format!("audit query failed: {e}"),
                        })
                    }
                }
            }
            DashboardCommand::Pong { timestamp } => {
                debug!("Received Pong with timestamp {}", timestamp);
                None
            }
        }
    }

    /// Broadcast an event to all connected dashboard clients
    pub fn broadcast(&self, event: BotEvent) {
        // no connected clients is fine
        let _ = self.event_tx.send(event);
    }

    /// Send a heartbeat to all clients
    pub fn send_heartbeat(&self) {
        let timestamp = chrono::Utc::now().timestamp();
        self.broadcast(BotEvent::Heartbeat { timestamp });
    }

    /// Send heartbeats every `period` until the server is dropped
    pub fn start_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let server = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match server.upgrade() {
                    Some(server) => server.send_heartbeat(),
                    None => break,
                }
            }
        })
    }
}

/// Writer half of a client connection: broadcasts and direct replies, in arrival order
async fn write_events(
    mut writer: OwnedWriteHalf,
    mut event_rx: broadcast::Receiver<BotEvent>,
    mut reply_rx: mpsc::Receiver<BotEvent>,
) {
    loop {
        let event = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(event) => event,
                None => break,
            },
            event = event_rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Client lagged behind by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let data = match encode_message(&event) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&data).await {
            debug!("Failed to write to client: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!("Failed to flush to client: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TenantId;
    use crate::features::audit::{AuditAction, AuditEntry, MemoryAuditStore};
    use crate::features::dedup::DedupConfig;
    use crate::features::rate_limiting::{GlobalRateGovernor, GovernorConfig};
    use crate::features::tenant_queue::TenantQueueConfig;
    use crate::ipc::client::IpcClient;
    use crate::transport::testing::ScriptedTransport;
    use tokio::time::timeout;

    fn server(socket_path: PathBuf) -> Arc<IpcServer> {
        let governor = GlobalRateGovernor::new(
            GovernorConfig::default(),
            Arc::new(ScriptedTransport::new()),
        );
        let supervisor = QueueSupervisor::new(governor, TenantQueueConfig::default());
        let audit = Arc::new(AuditBroadcaster::new(
            Arc::new(MemoryAuditStore::new()),
            &DedupConfig::default(),
        ));
        Arc::new(IpcServer::new(socket_path, supervisor, audit))
    }

    #[tokio::test]
    async fn test_get_status_reply() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path().join("gk.sock"));
        server.supervisor.on_tenant_added(TenantId(3));

        let reply = server.process_command(DashboardCommand::GetStatus).await;
        match reply {
            Some(BotEvent::GovernanceStatus { status }) => {
                assert_eq!(status.tenants.len(), 1);
                assert_eq!(status.governor.max_requests, 50);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(server
            .process_command(DashboardCommand::Pong { timestamp: 1 })
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_recent_audit_reply() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path().join("gk.sock"));
        server
            .audit
            .log(AuditEntry::new(TenantId(3), AuditAction::Warn, 1).with_target(2))
            .await
            .unwrap();

        let reply = server
            .process_command(DashboardCommand::GetRecentAudit {
                tenant_id: TenantId(3),
                limit: 10,
            })
            .await;
        match reply {
            Some(BotEvent::RecentAudit { tenant_id, records }) => {
                assert_eq!(tenant_id, TenantId(3));
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].action, AuditAction::Warn);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gk.sock");
        let server = server(path.clone());
        server.clone().start().await.unwrap();

        let mut client = IpcClient::connect_to(&path).await.unwrap();
        let status = client
            .fetch_status(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.governor.max_requests, 50);

        // heartbeats are answered by the client and never surface
        server.send_heartbeat();
        server
            .audit
            .log(AuditEntry::new(TenantId(8), AuditAction::Ban, 1).with_target(9))
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            BotEvent::AuditLogged { record } => assert_eq!(record.tenant_id, TenantId(8)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

//! # IPC Client
//!
//! Unix socket client for dashboards and `govstat` to talk to the bot.

use crate::core::status::GovernanceStatus;
use crate::core::types::TenantId;
use crate::features::audit::AuditRecord;
use crate::ipc::protocol::{encode_message, read_frame, BotEvent, DashboardCommand};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

/// Connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// IPC Client for dashboards
pub struct IpcClient {
    /// Event receiver channel
    event_rx: mpsc::Receiver<BotEvent>,
    /// Command sender channel
    command_tx: mpsc::Sender<DashboardCommand>,
}

impl IpcClient {
    pub async fn connect_to(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        info!("Connecting to IPC server at {}", socket_path.display());

        let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
            .await
            .map_err(|_| anyhow!("Connection timeout"))?
            .map_err(|e| anyhow!("Failed to connect: {}", e))?;

        info!("Connected to IPC server");

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            Self::connection_loop(stream, event_tx, command_rx).await;
        });

        Ok(IpcClient {
            event_rx,
            command_tx,
        })
    }

    /// Main connection loop - handles reading events and writing commands
    async fn connection_loop(
        stream: UnixStream,
        event_tx: mpsc::Sender<BotEvent>,
        mut command_rx: mpsc::Receiver<DashboardCommand>,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        let write_handle = tokio::spawn(async move {
            while let Some(cmd) = command_rx.recv().await {
                match encode_message(&cmd) {
                    Ok(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            error!("Failed to write command: {}", e);
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!("Failed to flush command: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to encode command: {}", e);
                    }
                }
            }
        });

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!("Read error: {}", e);
                    break;
                }
            };

            match serde_json::from_slice::<BotEvent>(&frame) {
                Ok(event) => {
                    if let BotEvent::Heartbeat { timestamp } = &event {
                        debug!("Received heartbeat: {}", timestamp);
                    }

                    if event_tx.send(event).await.is_err() {
                        debug!("Event receiver closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to parse event: {}", e);
                }
            }
        }

        write_handle.abort();
        info!("IPC connection closed");
    }

    /// Next event from the bot, answering heartbeats along the way.
    /// `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<BotEvent> {
        loop {
            match self.event_rx.recv().await? {
                BotEvent::Heartbeat { timestamp } => {
                    if let Err(e) = self.pong(timestamp).await {
                        warn!("Failed to answer heartbeat: {}", e);
                        return None;
                    }
                }
                event => return Some(event),
            }
        }
    }

    /// Send a command to the bot
    pub async fn send(&self, cmd: DashboardCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|e| anyhow!("Failed to send command: {}", e))
    }

    /// Request the governance snapshot
    pub async fn request_status(&self) -> Result<()> {
        self.send(DashboardCommand::GetStatus).await
    }

    /// Request the latest audit entries of a tenant
    pub async fn request_recent_audit(&self, tenant_id: TenantId, limit: usize) -> Result<()> {
        self.send(DashboardCommand::GetRecentAudit { tenant_id, limit })
            .await
    }

    async fn pong(&self, timestamp: i64) -> Result<()> {
        self.send(DashboardCommand::Pong { timestamp }).await
    }

    /// Request the snapshot and wait for it, skipping unrelated events
    pub async fn fetch_status(&mut self, wait: Duration) -> Result<GovernanceStatus> {
        self.request_status().await?;
        let deadline = Instant::now() + wait;
        loop {
            match self.next_event_until(deadline).await? {
                BotEvent::GovernanceStatus { status } => return Ok(status),
                BotEvent::CommandFailed { message } => return Err(anyhow!(message)),
                other => debug!("Skipping event while waiting for status: {:?}", other),
            }
        }
    }

    /// Request recent audit entries and wait for them, skipping unrelated events
    pub async fn fetch_recent_audit(
        &mut self,
        tenant_id: TenantId,
        limit: usize,
        wait: Duration,
    ) -> Result<Vec<AuditRecord>> {
        self.request_recent_audit(tenant_id, limit).await?;
        let deadline = Instant::now() + wait;
        loop {
            match self.next_event_until(deadline).await? {
                BotEvent::RecentAudit { records, .. } => return Ok(records),
                BotEvent::CommandFailed { message } => return Err(anyhow!(message)),
                other => debug!("Skipping event while waiting for audit entries: {:?}", other),
            }
        }
    }

    async fn next_event_until(&mut self, deadline: Instant) -> Result<BotEvent> {
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(anyhow!("IPC connection closed")),
            Err(_) => Err(anyhow!("Timed out waiting for the bot")),
        }
    }
}

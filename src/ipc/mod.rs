//! # IPC Module
//!
//! Inter-process communication between the bot and dashboard clients.
//!
//! - **Version**: 2.0.0
//! - **Since**: 3.17.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.0.0: Governance status and audit feed replace the chat relay
//! - 1.0.0: Initial IPC implementation with Unix socket protocol

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{BotEvent, DashboardCommand};
pub use server::IpcServer;

/// Default socket path for IPC communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/gatekeeper.sock";

/// Get the socket path from environment or use default
pub fn get_socket_path() -> String {
    std::env::var("GATEKEEPER_IPC_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string())
}

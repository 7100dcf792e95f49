//! # Command System
//!
//! Guild slash commands. Definitions are registered per tenant when the bot
//! joins a guild; replies go out through the tenant queue.
//!
//! - **Version**: 3.0.0
//! - **Since**: 0.2.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 3.0.0: Per-guild registration through the tenant queue, /governor status command
//! - 2.0.0: Remove bang commands, slash-only command system
//! - 1.0.0: Initial reorganization with modular command structure

pub mod governor;
pub mod slash;

pub use governor::{format_status_message, interaction_reply, respond_with_status};
pub use slash::{create_guild_commands, register_guild_commands, GOVERNOR_COMMAND};

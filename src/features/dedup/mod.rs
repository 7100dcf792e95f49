//! # Deduplication Feature
//!
//! Time-windowed suppression of repeated events.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false

pub mod debounce;
pub mod deduplicator;

pub use debounce::{spawn_sweeper, DebounceMap, Sweep};
pub use deduplicator::{DedupConfig, EventDeduplicator, EventSignature};

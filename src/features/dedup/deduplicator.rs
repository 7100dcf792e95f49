//! # Feature: Event Deduplication
//!
//! Answers "did we already act on (event type, identifier) within the last
//! window?" so handlers reached through several code paths (a reaction
//! delivered twice, a ban seen by two handlers) produce one side effect.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.1.0: Structured signatures instead of joined strings, per-entry windows for sweeping
//! - 1.0.0: Initial release

use super::debounce::{spawn_sweeper, DebounceMap, Sweep};
use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Debounce settings shared by every deduplicating component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    pub default_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            default_window: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Identity of a logical event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSignature {
    pub event_type: String,
    pub identifier: String,
}

impl EventSignature {
    pub fn new(event_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        EventSignature {
            event_type: event_type.into(),
            identifier: identifier.into(),
        }
    }
}

pub struct EventDeduplicator {
    seen: DebounceMap<EventSignature>,
    config: DedupConfig,
}

impl EventDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        EventDeduplicator {
            seen: DebounceMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// True if the same event was let through less than `window` ago
    /// (default window when `None`). A false verdict records the event.
    pub fn is_duplicate(&self, event_type: &str, identifier: &str, window: Option<Duration>) -> bool {
        let window = window.unwrap_or(self.config.default_window);
        let duplicate = self
            .seen
            .check_and_record(EventSignature::new(event_type, identifier), window);
        if duplicate {
            debug!("Suppressed duplicate {event_type} event for {identifier}");
        }
        duplicate
    }

    /// Run `action` only if the event is not a duplicate. Returns whether it ran.
    pub async fn process<F, Fut>(
        &self,
        event_type: &str,
        identifier: &str,
        window: Option<Duration>,
        action: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.is_duplicate(event_type, identifier, window) {
            return false;
        }
        action().await;
        true
    }

    /// Clear a recorded event so the next sighting is let through
    pub fn forget(&self, event_type: &str, identifier: &str) -> bool {
        self.seen.forget(&EventSignature::new(event_type, identifier))
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    /// Sweep on `sweep_interval` until the deduplicator is dropped
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_sweeper(self, self.config.sweep_interval)
    }
}

impl Sweep for EventDeduplicator {
    fn sweep(&self) -> usize {
        self.seen.sweep()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

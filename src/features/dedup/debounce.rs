//! Time-windowed "seen recently" map shared by the event deduplicator and the
//! audit broadcaster's signature cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Anything that periodically evicts stale entries
pub trait Sweep: Send + Sync + 'static {
    /// Evict stale entries, returning how many were removed
    fn sweep(&self) -> usize;
}

/// Sweep `target` every `period` until it is dropped
pub fn spawn_sweeper<T: Sweep>(target: &Arc<T>, period: Duration) -> JoinHandle<()> {
    let weak: Weak<T> = Arc::downgrade(target);
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = weak.upgrade() else {
                return;
            };
            let evicted = target.sweep();
            if evicted > 0 {
                debug!("Sweep evicted {evicted} debounce entries");
            }
        }
    })
}

#[derive(Debug, Clone, Copy)]
struct DebounceEntry {
    last_seen_at: Instant,
    window: Duration,
}

impl DebounceEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen_at) < self.window
    }

    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen_at) >= self.window * 2
    }
}

/// Keyed by a structured signature; the check-and-record for one key runs
/// under its shard lock, so two racing callers never both get "first".
pub struct DebounceMap<K: Eq + Hash> {
    entries: DashMap<K, DebounceEntry>,
}

impl<K: Eq + Hash> DebounceMap<K> {
    pub fn new() -> Self {
        DebounceMap {
            entries: DashMap::new(),
        }
    }

    /// Returns true if `key` was recorded less than `window` ago. A duplicate
    /// verdict leaves the original timestamp untouched.
    pub fn check_and_record(&self, key: K, window: Duration) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    true
                } else {
                    occupied.insert(DebounceEntry {
                        last_seen_at: now,
                        window,
                    });
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DebounceEntry {
                    last_seen_at: now,
                    window,
                });
                false
            }
        }
    }

    /// Whether `key` is currently suppressing duplicates, without recording
    pub fn is_live(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries.get(key).map(|e| e.is_live(now)).unwrap_or(false)
    }

    pub fn forget(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict entries older than twice their window. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash> Default for DebounceMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

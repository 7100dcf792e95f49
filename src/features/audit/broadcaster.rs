//! # Feature: Audit Broadcaster
//!
//! Records moderation and bookkeeping actions and pushes them to live
//! subscribers (the dashboard feed). The same action often reaches us twice,
//! e.g. a ban reported by the gateway and by the command that issued it, so
//! every entry is checked against a signature cache before anything is
//! persisted or broadcast.
//!
//! - **Version**: 1.1.0
//! - **Since**: 1.0.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.1.0: Release the signature when persistence fails
//! - 1.0.0: Initial release

use super::store::AuditStore;
use crate::core::types::TenantId;
use crate::features::dedup::{spawn_sweeper, DebounceMap, DedupConfig, Sweep};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Live subscriber buffer
const AUDIT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Ban,
    Unban,
    Kick,
    Timeout,
    Warn,
    MessageDelete,
    ReactionAdd,
    CommandsRegistered,
    Custom(String),
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Ban => write!(f, "ban"),
            AuditAction::Unban => write!(f, "unban"),
            AuditAction::Kick => write!(f, "kick"),
            AuditAction::Timeout => write!(f, "timeout"),
            AuditAction::Warn => write!(f, "warn"),
            AuditAction::MessageDelete => write!(f, "message_delete"),
            AuditAction::ReactionAdd => write!(f, "reaction_add"),
            AuditAction::CommandsRegistered => write!(f, "commands_registered"),
            AuditAction::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// An action to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    pub action: AuditAction,
    pub actor_id: u64,
    pub target_id: Option<u64>,
    pub reason: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(tenant_id: TenantId, action: AuditAction, actor_id: u64) -> Self {
        AuditEntry {
            tenant_id,
            action,
            actor_id,
            target_id: None,
            reason: None,
            details: None,
        }
    }

    pub fn with_target(mut self, target_id: u64) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn signature(&self) -> AuditSignature {
        AuditSignature {
            tenant_id: self.tenant_id,
            action: self.action.clone(),
            actor_id: self.actor_id,
            target_id: self.target_id,
        }
    }
}

/// What makes two audit entries "the same action"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuditSignature {
    pub tenant_id: TenantId,
    pub action: AuditAction,
    pub actor_id: u64,
    pub target_id: Option<u64>,
}

/// A persisted audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub action: AuditAction,
    pub actor_id: u64,
    pub target_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_entry(entry: AuditEntry) -> Self {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: entry.tenant_id,
            action: entry.action,
            actor_id: entry.actor_id,
            target_id: entry.target_id,
            reason: entry.reason,
            details: entry.details,
            created_at: Utc::now(),
        }
    }
}

/// Recently recorded audit signatures
pub struct DuplicateSignatureCache {
    seen: DebounceMap<AuditSignature>,
    window: Duration,
}

impl DuplicateSignatureCache {
    pub fn new(window: Duration) -> Self {
        DuplicateSignatureCache {
            seen: DebounceMap::new(),
            window,
        }
    }

    /// True if the signature was recorded within the window; otherwise records it
    pub fn check_and_record(&self, signature: AuditSignature) -> bool {
        self.seen.check_and_record(signature, self.window)
    }

    pub fn release(&self, signature: &AuditSignature) {
        self.seen.forget(signature);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

pub struct AuditBroadcaster {
    store: Arc<dyn AuditStore>,
    signatures: DuplicateSignatureCache,
    events: broadcast::Sender<AuditRecord>,
    sweep_interval: Duration,
}

impl AuditBroadcaster {
    pub fn new(store: Arc<dyn AuditStore>, config: &DedupConfig) -> Self {
        let (events, _) = broadcast::channel(AUDIT_CHANNEL_CAPACITY);
        AuditBroadcaster {
            store,
            signatures: DuplicateSignatureCache::new(config.default_window),
            events,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Live feed of recorded entries
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.events.subscribe()
    }

    /// Persist and broadcast an entry. Returns `None` when an identical
    /// entry was recorded within the debounce window; nothing is written then.
    pub async fn log(&self, entry: AuditEntry) -> Result<Option<AuditRecord>> {
        let signature = entry.signature();
        if self.signatures.check_and_record(signature.clone()) {
            debug!(
                "Suppressed duplicate audit entry: {} by {} in {}",
                signature.action, signature.actor_id, signature.tenant_id
            );
            return Ok(None);
        }

        let record = AuditRecord::from_entry(entry);
        if let Err(e) = self.store.append(&record).await {
            // let a later identical entry through since this one never landed
            self.signatures.release(&signature);
            return Err(e.context("failed to persist audit record"));
        }

        info!(
            "Audit: {} by {} in {} (target: {:?})",
            record.action, record.actor_id, record.tenant_id, record.target_id
        );
        // no subscribers is fine
        let _ = self.events.send(record.clone());
        Ok(Some(record))
    }

    pub async fn recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<AuditRecord>> {
        self.store.recent(tenant_id, limit).await
    }

    /// Let the store release what it holds for a tenant that left
    pub async fn forget_tenant(&self, tenant_id: TenantId) -> Result<()> {
        self.store.forget_tenant(tenant_id).await
    }

    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_sweeper(self, self.sweep_interval)
    }
}

impl Sweep for AuditBroadcaster {
    fn sweep(&self) -> usize {
        self.signatures.seen.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::audit::MemoryAuditStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::sleep;

    fn broadcaster(store: Arc<dyn AuditStore>, window: Duration) -> AuditBroadcaster {
        AuditBroadcaster::new(
            store,
            &DedupConfig {
                default_window: window,
                sweep_interval: Duration::from_secs(60),
            },
        )
    }

    fn ban(target: u64) -> AuditEntry {
        AuditEntry::new(TenantId(1), AuditAction::Ban, 100)
            .with_target(target)
            .with_reason("spam")
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_entry_has_no_side_effect() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = broadcaster(store.clone(), Duration::from_secs(2));
        let mut feed = audit.subscribe();

        let first = audit.log(ban(7)).await.unwrap();
        let second = audit.log(ban(7)).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.total(), 1);
        assert_eq!(feed.recv().await.unwrap().target_id, Some(7));
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_signature_is_recorded() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = broadcaster(store.clone(), Duration::from_secs(2));

        assert!(audit.log(ban(7)).await.unwrap().is_some());
        assert!(audit.log(ban(8)).await.unwrap().is_some());
        assert!(audit
            .log(AuditEntry::new(TenantId(1), AuditAction::Kick, 100).with_target(7))
            .await
            .unwrap()
            .is_some());
        assert!(audit
            .log(AuditEntry::new(TenantId(2), AuditAction::Ban, 100).with_target(7))
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.total(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reason_is_not_part_of_signature() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = broadcaster(store.clone(), Duration::from_secs(2));

        assert!(audit.log(ban(7)).await.unwrap().is_some());
        assert!(audit.log(ban(7).with_reason("other wording")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_entry_after_window_is_recorded() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = broadcaster(store.clone(), Duration::from_millis(100));

        assert!(audit.log(ban(7)).await.unwrap().is_some());
        sleep(Duration::from_millis(150)).await;
        assert!(audit.log(ban(7)).await.unwrap().is_some());
        assert_eq!(store.total(), 2);
    }

    struct FlakyStore {
        fail_next: AtomicBool,
        inner: MemoryAuditStore,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append(&self, record: &AuditRecord) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.append(record).await
        }

        async fn recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<AuditRecord>> {
            self.inner.recent(tenant_id, limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_persist_releases_signature() {
        let store = Arc::new(FlakyStore {
            fail_next: AtomicBool::new(true),
            inner: MemoryAuditStore::new(),
        });
        let audit = broadcaster(store.clone(), Duration::from_secs(2));
        let mut feed = audit.subscribe();

        assert!(audit.log(ban(7)).await.is_err());
        assert!(feed.try_recv().is_err());

        let retried = audit.log(ban(7)).await.unwrap();
        assert!(retried.is_some());
        assert_eq!(audit.recent(TenantId(1), 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_clears_signatures() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = broadcaster(store, Duration::from_millis(100));

        audit.log(ban(1)).await.unwrap();
        audit.log(ban(2)).await.unwrap();
        assert_eq!(audit.signatures.len(), 2);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(audit.sweep(), 2);
        assert!(audit.signatures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_record_once() {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = Arc::new(broadcaster(store.clone(), Duration::from_secs(2)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let audit = audit.clone();
            handles.push(tokio::spawn(async move { audit.log(ban(7)).await.unwrap() }));
        }
        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        assert_eq!(store.total(), 1);
    }
}

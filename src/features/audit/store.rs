//! Audit persistence collaborators.

use super::broadcaster::AuditRecord;
use crate::core::types::TenantId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Where recorded audit entries are kept
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Most recent records for a tenant, newest last
    async fn recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<AuditRecord>>;

    /// The tenant is gone. Durable stores keep its history.
    async fn forget_tenant(&self, _tenant_id: TenantId) -> Result<()> {
        Ok(())
    }
}

/// Records kept per tenant by `MemoryAuditStore` before the oldest is dropped
pub const MEMORY_RECORDS_PER_TENANT: usize = 1000;

/// Process-local store, lost on restart. Keeps the latest `capacity` records
/// per tenant and drops a tenant's records when it leaves.
pub struct MemoryAuditStore {
    records: DashMap<TenantId, VecDeque<AuditRecord>>,
    capacity: usize,
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::with_capacity(MEMORY_RECORDS_PER_TENANT)
    }
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MemoryAuditStore {
            records: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records.entry(record.tenant_id).or_default();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }

    async fn recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .get(&tenant_id)
            .map(|records| {
                let skip = records.len().saturating_sub(limit);
                records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn forget_tenant(&self, tenant_id: TenantId) -> Result<()> {
        self.records.remove(&tenant_id);
        Ok(())
    }
}

/// Append-only JSON-lines file, one record per line
pub struct JsonlAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlAuditStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<AuditRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read audit log {}", self.path.display()))
            }
        };

        let mut records: Vec<AuditRecord> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
            .filter(|record| record.tenant_id == tenant_id)
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

//! In-memory audit store.
//!
//! Used by tests and by embedders that keep their audit trail elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{latest_by_change, latest_of, AuditError, AuditStore};
use crate::domain::{AuditEntry, ImportMarker};

#[derive(Default)]
struct Inner {
    entries: Vec<AuditEntry>,
    markers: HashMap<String, ImportMarker>,
}

/// Audit store held entirely in memory
#[derive(Default)]
pub struct InMemoryAuditStore {
    inner: RwLock<Inner>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in insertion order
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.read().await.entries.clone()
    }

    /// Number of entries written
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, entry: &AuditEntry) -> Result<u64, AuditError> {
        let mut inner = self.inner.write().await;
        let sequence = inner.entries.len() as u64 + 1;
        let mut entry = entry.clone();
        entry.sequence = sequence;
        inner.entries.push(entry);
        Ok(sequence)
    }

    async fn latest_entry(&self, change_id: &str) -> Result<Option<AuditEntry>, AuditError> {
        let inner = self.inner.read().await;
        Ok(latest_of(inner.entries.iter().filter(|e| e.change_id == change_id)).cloned())
    }

    async fn all_latest_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let inner = self.inner.read().await;
        Ok(latest_by_change(inner.entries.iter().cloned()))
    }

    async fn history(&self, change_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.change_id == change_id)
            .cloned()
            .collect())
    }

    async fn import_marker(&self, source: &str) -> Result<Option<ImportMarker>, AuditError> {
        Ok(self.inner.read().await.markers.get(source).cloned())
    }

    async fn write_import_marker(&self, marker: &ImportMarker) -> Result<(), AuditError> {
        self.inner
            .write()
            .await
            .markers
            .insert(marker.source.clone(), marker.clone());
        Ok(())
    }
}

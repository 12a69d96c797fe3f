//! Audit store: append/query interface over the immutable execution log.
//!
//! Stores only guarantee atomic single appends and insertion order. The
//! "latest entry" rule (greatest timestamp, ties broken by sequence) is
//! implemented once here and shared by every backend.

pub mod fix;
pub mod jsonl;
pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AuditEntry, AuditState, ImportMarker, PipelineDefinition};

pub use fix::{fix_entry, FixOutcome, Resolution};
pub use jsonl::JsonlAuditStore;
pub use memory::InMemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Errors raised by audit stores
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Audit store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt audit record: {0}")]
    Corrupt(String),
}

impl AuditError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Unavailable(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Append/query contract every audit backend implements
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Append an entry, returning the sequence number assigned to it
    async fn append(&self, entry: &AuditEntry) -> Result<u64, AuditError>;

    /// Latest entry for a change, if any
    async fn latest_entry(&self, change_id: &str) -> Result<Option<AuditEntry>, AuditError>;

    /// Latest entry of every change, ordered by sequence
    async fn all_latest_entries(&self) -> Result<Vec<AuditEntry>, AuditError>;

    /// Every entry recorded for a change, in insertion order
    async fn history(&self, change_id: &str) -> Result<Vec<AuditEntry>, AuditError>;

    /// Import marker for a legacy source, if that source was imported
    async fn import_marker(&self, source: &str) -> Result<Option<ImportMarker>, AuditError>;

    /// Record that a legacy source has been imported
    async fn write_import_marker(&self, marker: &ImportMarker) -> Result<(), AuditError>;
}

/// Reduce entries to the latest one per change id, ordered by sequence
pub fn latest_by_change<I>(entries: I) -> Vec<AuditEntry>
where
    I: IntoIterator<Item = AuditEntry>,
{
    let mut latest: HashMap<String, AuditEntry> = HashMap::new();

    for entry in entries {
        match latest.get(&entry.change_id) {
            Some(current) if !entry.is_newer_than(current) => {}
            _ => {
                latest.insert(entry.change_id.clone(), entry);
            }
        }
    }

    let mut result: Vec<AuditEntry> = latest.into_values().collect();
    result.sort_by_key(|e| e.sequence);
    result
}

/// Latest entry for a single change among `entries`
pub fn latest_of<'a, I>(entries: I) -> Option<&'a AuditEntry>
where
    I: IntoIterator<Item = &'a AuditEntry>,
{
    entries.into_iter().fold(None, |best, e| match best {
        Some(b) if !e.is_newer_than(b) => Some(b),
        _ => Some(e),
    })
}

/// Point-in-time view of the latest entry per change
#[derive(Debug, Clone, Default)]
pub struct AuditSnapshot {
    entries: HashMap<String, AuditEntry>,
}

/// A change whose audited checksum differs from the loaded definition
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub change_id: String,
    pub stage: String,
    pub recorded: String,
    pub current: String,
}

impl AuditSnapshot {
    /// Build a snapshot from latest entries
    pub fn from_entries(entries: Vec<AuditEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.change_id.clone(), e))
                .collect(),
        }
    }

    /// Read a snapshot from a store
    pub async fn load(store: &dyn AuditStore) -> Result<Self, AuditError> {
        Ok(Self::from_entries(store.all_latest_entries().await?))
    }

    /// Latest entry of a change
    pub fn get(&self, change_id: &str) -> Option<&AuditEntry> {
        self.entries.get(change_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries left Pending or Failed, ordered by sequence
    pub fn issues(&self) -> Vec<&AuditEntry> {
        let mut issues: Vec<&AuditEntry> = self
            .entries
            .values()
            .filter(|e| e.state.needs_attention())
            .collect();
        issues.sort_by_key(|e| e.sequence);
        issues
    }

    /// Executed changes whose recorded checksum no longer matches the definition
    pub fn drift(&self, definition: &PipelineDefinition) -> Vec<DriftReport> {
        definition
            .changes()
            .filter_map(|(stage, change)| {
                let entry = self.get(&change.id)?;
                if entry.state != AuditState::Executed {
                    return None;
                }
                let recorded = entry.checksum.as_ref()?;
                if *recorded == change.checksum {
                    return None;
                }
                Some(DriftReport {
                    change_id: change.id.clone(),
                    stage: stage.name.clone(),
                    recorded: recorded.clone(),
                    current: change.checksum.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeUnit, Stage};
    use chrono::{Duration, Utc};

    fn entry(change_id: &str, state: AuditState, sequence: u64) -> AuditEntry {
        let mut e = AuditEntry::new(change_id, "s", state, "dev", Some("abc".into()), "run");
        e.sequence = sequence;
        e
    }

    #[test]
    fn test_latest_by_change_prefers_newer_timestamp() {
        let now = Utc::now();
        let newer = entry("c1", AuditState::Failed, 1).with_timestamp(now);
        let older = entry("c1", AuditState::Executed, 2).with_timestamp(now - Duration::seconds(10));

        let latest = latest_by_change(vec![newer, older]);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].state, AuditState::Failed);
    }

    #[test]
    fn test_latest_by_change_tie_uses_sequence() {
        let now = Utc::now();
        let a = entry("c1", AuditState::Pending, 1).with_timestamp(now);
        let b = entry("c1", AuditState::Executed, 2).with_timestamp(now);
        let c = entry("c2", AuditState::Executed, 3).with_timestamp(now);

        let latest = latest_by_change(vec![b.clone(), a, c]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0], b);
        assert_eq!(latest[1].change_id, "c2");
        assert_eq!(latest_of(&latest[..1]).unwrap().state, AuditState::Executed);
    }

    #[test]
    fn test_snapshot_issues_and_drift() {
        let definition = PipelineDefinition::new(vec![Stage::sequential(
            "s",
            vec![
                ChangeUnit::new("c1", 1, "kv", "set a 1").with_checksum("abc"),
                ChangeUnit::new("c2", 2, "kv", "set b 1").with_checksum("xyz"),
                ChangeUnit::new("c3", 3, "kv", "set c 1"),
            ],
        )]);
        let snapshot = AuditSnapshot::from_entries(vec![
            entry("c1", AuditState::Executed, 1),
            entry("c2", AuditState::Executed, 2),
            entry("c3", AuditState::Pending, 3),
        ]);

        let drift = snapshot.drift(&definition);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].change_id, "c2");
        assert_eq!(drift[0].recorded, "abc");

        let issues = snapshot.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].change_id, "c3");
    }
}

//! One-shot import of a legacy audit history.
//!
//! Records of the previous tool are translated into audit entries and
//! appended once; an import marker makes later invocations no-ops. A change
//! that already has entries in the current store keeps them.

pub mod record;
pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::audit::{AuditError, AuditStore};
use crate::domain::{AuditEntry, AuditState, ImportMarker, PipelineDefinition};

pub use record::{
    is_imported, LegacyRecord, LegacyTimestamp, Translation, LEGACY_EXECUTION_PREFIX,
    LEGACY_IMPORT_AUTHOR,
};
pub use source::{InMemoryLegacySource, JsonlLegacySource, LegacyAuditSource};

/// Stage assigned to imported changes missing from the definition
pub const LEGACY_STAGE: &str = "legacy";

/// Errors raised while importing legacy history
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read legacy source '{source_name}': {message}")]
    Read {
        source_name: String,
        message: String,
    },

    #[error("Legacy record for '{change_id}' has unknown state '{state}'")]
    UnknownState { change_id: String, state: String },

    #[error("Legacy record for '{change_id}' has unknown type '{change_type}'")]
    UnknownType {
        change_id: String,
        change_type: String,
    },

    #[error("Legacy record for '{change_id}' has invalid timestamp '{value}'")]
    InvalidTimestamp { change_id: String, value: String },

    #[error("Audit store error during import: {0}")]
    Audit(#[from] AuditError),
}

/// What an import run did
#[derive(Debug, Clone, PartialEq)]
pub enum ImportResult {
    /// The source was imported before
    AlreadyImported { marker: ImportMarker },

    /// The source holds no records; nothing written
    NoLegacyRecords,

    Imported {
        imported: usize,
        /// Records of changes the current store already tracks
        skipped_existing: usize,
        /// Ignored, pre-execution and system records
        skipped_ignored: usize,
    },
}

/// Imports legacy history into an audit store
pub struct LegacyImporter {
    audit: Arc<dyn AuditStore>,
}

impl LegacyImporter {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self { audit }
    }

    /// Import `source` unless it was imported already.
    ///
    /// Stages come from `definition` when the change is declared there.
    #[instrument(skip_all, fields(source = source.name()))]
    pub async fn import_if_needed(
        &self,
        source: &dyn LegacyAuditSource,
        definition: Option<&PipelineDefinition>,
    ) -> Result<ImportResult, ImportError> {
        if let Some(marker) = self.audit.import_marker(source.name()).await? {
            info!(imported_at = %marker.imported_at, "Legacy history already imported");
            return Ok(ImportResult::AlreadyImported { marker });
        }

        let records = source.read_history().await?;
        if records.is_empty() {
            info!("No legacy records found");
            return Ok(ImportResult::NoLegacyRecords);
        }

        // Translate everything up front so a bad record aborts before any write
        let mut entries = Vec::new();
        let mut skipped_ignored = 0;
        for record in &records {
            let stage = definition
                .and_then(|d| d.find_change(&record.change_id))
                .map(|(stage, _)| stage.name.as_str())
                .unwrap_or(LEGACY_STAGE);

            match record.translate(stage)? {
                Translation::Entry(entry) => entries.push(entry),
                Translation::Skipped => skipped_ignored += 1,
            }
        }

        let existing = self.existing_entries().await?;

        let before = entries.len();
        entries.retain(|e| {
            !existing.owned.contains(&e.change_id)
                && !existing.imported.contains(&ImportKey::of(e))
        });
        let skipped_existing = before - entries.len();

        entries.sort_by_key(|e| e.timestamp);
        for entry in &entries {
            self.audit.append(entry).await?;
        }

        let marker = ImportMarker {
            source: source.name().to_string(),
            imported_at: Utc::now(),
            imported_count: entries.len(),
            skipped_count: skipped_existing + skipped_ignored,
        };
        self.audit.write_import_marker(&marker).await?;

        info!(
            imported = entries.len(),
            skipped_existing, skipped_ignored, "Legacy history imported"
        );
        Ok(ImportResult::Imported {
            imported: entries.len(),
            skipped_existing,
            skipped_ignored,
        })
    }

    /// Split the current store into changes it owns and entries left by
    /// an earlier import that stopped before writing its marker
    async fn existing_entries(&self) -> Result<ExistingEntries, ImportError> {
        let mut existing = ExistingEntries::default();

        for latest in self.audit.all_latest_entries().await? {
            if !is_imported(&latest) {
                existing.owned.insert(latest.change_id);
                continue;
            }

            let history = self.audit.history(&latest.change_id).await?;
            if history.iter().all(is_imported) {
                existing.imported.extend(history.iter().map(ImportKey::of));
            } else {
                existing.owned.insert(latest.change_id);
            }
        }

        Ok(existing)
    }
}

/// Identity of an imported entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImportKey {
    change_id: String,
    timestamp_micros: i64,
    execution_id: String,
    state: AuditState,
}

impl ImportKey {
    fn of(entry: &AuditEntry) -> Self {
        Self {
            change_id: entry.change_id.clone(),
            timestamp_micros: entry.timestamp.timestamp_micros(),
            execution_id: entry.execution_id.clone(),
            state: entry.state,
        }
    }
}

#[derive(Debug, Default)]
struct ExistingEntries {
    /// Changes with entries the current schema wrote
    owned: HashSet<String>,

    /// Entries of changes only ever touched by an import
    imported: HashSet<ImportKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::domain::{ChangeUnit, Stage};
    use chrono::Duration;

    #[tokio::test]
    async fn test_import_resolves_stage_and_skips_existing() {
        let audit = Arc::new(InMemoryAuditStore::new());
        audit
            .append(&AuditEntry::new("c2", "data", AuditState::Failed, "dev", None, "r"))
            .await
            .unwrap();

        let definition = PipelineDefinition::new(vec![Stage::sequential(
            "init",
            vec![ChangeUnit::new("c1", 1, "kv", "set a 1")],
        )]);
        let now = Utc::now();
        let source = InMemoryLegacySource::new(
            "mongock",
            vec![
                LegacyRecord::executed("c1", now - Duration::days(2)),
                LegacyRecord::executed("c2", now - Duration::days(1)),
                LegacyRecord::executed("c3", now).with_state("IGNORED"),
                LegacyRecord::executed("c4", now - Duration::days(3)),
            ],
        );

        let importer = LegacyImporter::new(audit.clone());
        let result = importer
            .import_if_needed(&source, Some(&definition))
            .await
            .unwrap();
        assert_eq!(
            result,
            ImportResult::Imported {
                imported: 2,
                skipped_existing: 1,
                skipped_ignored: 1,
            }
        );

        let c1 = audit.latest_entry("c1").await.unwrap().unwrap();
        assert_eq!(c1.stage, "init");
        let c4 = audit.latest_entry("c4").await.unwrap().unwrap();
        assert_eq!(c4.stage, LEGACY_STAGE);
        assert_eq!(
            audit.latest_entry("c2").await.unwrap().unwrap().state,
            AuditState::Failed
        );

        // Oldest record first
        let entries = audit.entries().await;
        assert_eq!(entries[1].change_id, "c4");
        assert_eq!(entries[2].change_id, "c1");
    }

    #[tokio::test]
    async fn test_rerun_completes_an_interrupted_import() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let now = Utc::now();
        let failed = LegacyRecord::executed("c1", now - Duration::hours(2)).with_state("FAILED");
        let records = vec![
            failed.clone(),
            LegacyRecord::executed("c1", now - Duration::hours(1)),
            LegacyRecord::executed("c2", now),
        ];

        // A previous import wrote its first entry, then stopped before the marker
        let Translation::Entry(partial) = failed.translate(LEGACY_STAGE).unwrap() else {
            panic!("record should be imported");
        };
        audit.append(&partial).await.unwrap();

        let source = InMemoryLegacySource::new("mongock", records);
        let result = LegacyImporter::new(audit.clone())
            .import_if_needed(&source, None)
            .await
            .unwrap();
        assert_eq!(
            result,
            ImportResult::Imported {
                imported: 2,
                skipped_existing: 1,
                skipped_ignored: 0,
            }
        );

        let history = audit.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            audit.latest_entry("c1").await.unwrap().unwrap().state,
            AuditState::Executed
        );
        assert!(audit.latest_entry("c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_state_aborts_without_writes() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let source = InMemoryLegacySource::new(
            "mongock",
            vec![
                LegacyRecord::executed("c1", Utc::now()),
                LegacyRecord::executed("c2", Utc::now()).with_state("WEIRD"),
            ],
        );

        let result = LegacyImporter::new(audit.clone())
            .import_if_needed(&source, None)
            .await;
        assert!(matches!(result, Err(ImportError::UnknownState { .. })));
        assert!(audit.is_empty().await);
        assert!(audit.import_marker("mongock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_source_writes_no_marker() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let source = InMemoryLegacySource::new("mongock", Vec::new());

        let result = LegacyImporter::new(audit.clone())
            .import_if_needed(&source, None)
            .await
            .unwrap();
        assert_eq!(result, ImportResult::NoLegacyRecords);
        assert!(audit.import_marker("mongock").await.unwrap().is_none());
    }
}

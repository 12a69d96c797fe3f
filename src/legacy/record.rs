//! Legacy audit records and their translation to audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ImportError;
use crate::domain::{AuditEntry, AuditState};

/// Author and execution id used when a legacy record has none
pub const LEGACY_IMPORT_AUTHOR: &str = "legacy-import";

/// Prefix on the execution id of every imported entry
pub const LEGACY_EXECUTION_PREFIX: &str = "legacy:";

/// Whether an audit entry was written by a legacy import
pub fn is_imported(entry: &AuditEntry) -> bool {
    entry.execution_id.starts_with(LEGACY_EXECUTION_PREFIX)
}

/// Timestamp as found in legacy records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyTimestamp {
    /// Milliseconds since the Unix epoch
    EpochMillis(i64),

    /// RFC 3339 text
    Text(String),
}

impl LegacyTimestamp {
    fn to_datetime(&self, change_id: &str) -> Result<DateTime<Utc>, ImportError> {
        let invalid = |value: String| ImportError::InvalidTimestamp {
            change_id: change_id.to_string(),
            value,
        };

        match self {
            Self::EpochMillis(ms) => {
                DateTime::from_timestamp_millis(*ms).ok_or_else(|| invalid(ms.to_string()))
            }
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| invalid(text.clone())),
        }
    }
}

fn default_type() -> String {
    "EXECUTION".to_string()
}

/// One record of the legacy audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    #[serde(default)]
    pub execution_id: Option<String>,

    pub change_id: String,

    #[serde(default)]
    pub author: Option<String>,

    pub timestamp: LegacyTimestamp,

    /// EXECUTED, FAILED, ROLLED_BACK, ROLLBACK_FAILED or IGNORED
    pub state: String,

    /// EXECUTION or BEFORE_EXECUTION
    #[serde(rename = "type", default = "default_type")]
    pub change_type: String,

    #[serde(default)]
    pub execution_millis: u64,

    #[serde(default)]
    pub error_trace: Option<String>,

    /// Internal changes of the legacy tool itself
    #[serde(default)]
    pub system_change: bool,
}

/// Outcome of translating one legacy record
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Entry(AuditEntry),

    /// Not carried over (ignored, pre-execution or system records)
    Skipped,
}

impl LegacyRecord {
    /// Record of an executed change, mainly for tests and fixtures
    pub fn executed(change_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            execution_id: None,
            change_id: change_id.into(),
            author: None,
            timestamp: LegacyTimestamp::EpochMillis(timestamp.timestamp_millis()),
            state: "EXECUTED".to_string(),
            change_type: default_type(),
            execution_millis: 0,
            error_trace: None,
            system_change: false,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    /// Translate into an audit entry of `stage`
    pub fn translate(&self, stage: &str) -> Result<Translation, ImportError> {
        let state = match self.state.as_str() {
            "EXECUTED" => AuditState::Executed,
            "FAILED" | "ROLLBACK_FAILED" => AuditState::Failed,
            "ROLLED_BACK" => AuditState::RolledBack,
            "IGNORED" => return Ok(Translation::Skipped),
            other => {
                return Err(ImportError::UnknownState {
                    change_id: self.change_id.clone(),
                    state: other.to_string(),
                })
            }
        };

        match self.change_type.as_str() {
            "EXECUTION" => {}
            "BEFORE_EXECUTION" => return Ok(Translation::Skipped),
            other => {
                return Err(ImportError::UnknownType {
                    change_id: self.change_id.clone(),
                    change_type: other.to_string(),
                })
            }
        }

        if self.system_change {
            return Ok(Translation::Skipped);
        }

        let timestamp = self.timestamp.to_datetime(&self.change_id)?;
        let mut entry = AuditEntry::new(
            self.change_id.clone(),
            stage,
            state,
            self.author.as_deref().unwrap_or(LEGACY_IMPORT_AUTHOR),
            None,
            format!(
                "{}{}",
                LEGACY_EXECUTION_PREFIX,
                self.execution_id.as_deref().unwrap_or(LEGACY_IMPORT_AUTHOR)
            ),
        )
        .with_timestamp(timestamp)
        .with_duration(self.execution_millis);
        entry.error = self.error_trace.clone();

        Ok(Translation::Entry(entry))
    }
}

//! Audit entries: the immutable record of change execution outcomes.
//!
//! Entries are append-only. The most recent entry for a change id is its
//! current state; older entries are kept for traceability.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::change::ChangeUnit;

/// A single record in the audit log.
///
/// Field names follow the logical audit schema shared with reporting
/// tools and the legacy importer (`changeId`, `durationMillis`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Change this entry belongs to
    pub change_id: String,

    /// Stage the change was declared in
    pub stage: String,

    /// Outcome recorded by this entry
    pub state: AuditState,

    /// Author of the change
    pub author: String,

    /// Checksum at execution time (absent for imported legacy records)
    pub checksum: Option<String>,

    /// When the entry was written (or the original time for imports)
    pub timestamp: DateTime<Utc>,

    /// Execution time in milliseconds
    pub duration_millis: u64,

    /// Error detail for failed attempts
    pub error: Option<String>,

    /// Run that produced the entry
    pub execution_id: String,

    /// Target system the change ran against
    #[serde(default)]
    pub target_system: Option<String>,

    /// Insertion order, assigned by the store on append
    #[serde(default)]
    pub sequence: u64,
}

impl AuditEntry {
    /// Create an entry with the current timestamp
    pub fn new(
        change_id: impl Into<String>,
        stage: impl Into<String>,
        state: AuditState,
        author: impl Into<String>,
        checksum: Option<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            change_id: change_id.into(),
            stage: stage.into(),
            state,
            author: author.into(),
            checksum,
            timestamp: Utc::now(),
            duration_millis: 0,
            error: None,
            execution_id: execution_id.into(),
            target_system: None,
            sequence: 0,
        }
    }

    /// Create an entry describing a change unit of the running definition
    pub fn for_change(
        change: &ChangeUnit,
        stage: &str,
        state: AuditState,
        execution_id: &str,
    ) -> Self {
        Self::new(
            change.id.clone(),
            stage,
            state,
            change.author.clone(),
            Some(change.checksum.clone()),
            execution_id,
        )
        .with_target_system(change.target_system.clone())
    }

    /// Attach the execution duration
    pub fn with_duration(mut self, duration_millis: u64) -> Self {
        self.duration_millis = duration_millis;
        self
    }

    /// Attach error detail
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the target system id
    pub fn with_target_system(mut self, target_system: impl Into<String>) -> Self {
        self.target_system = Some(target_system.into());
        self
    }

    /// Override the timestamp (imports keep the original time)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this entry supersedes `other` as the latest state
    pub fn is_newer_than(&self, other: &AuditEntry) -> bool {
        (self.timestamp, self.sequence) > (other.timestamp, other.sequence)
    }
}

/// Per-change audit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditState {
    /// Attempt started (non-transactional marker)
    Pending,

    /// Applied successfully
    Executed,

    /// Attempt failed; the target may be partially changed
    Failed,

    /// Compensated after failure, or rolled back manually
    RolledBack,

    /// Skipped because it was already applied
    Ignored,
}

impl AuditState {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Ignored => "IGNORED",
        }
    }

    /// States an operator needs to look at
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Unknown audit state text
#[derive(Debug, Error)]
#[error("Unknown audit state: {0}")]
pub struct ParseAuditStateError(pub String);

impl FromStr for AuditState {
    type Err = ParseAuditStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "EXECUTED" => Ok(Self::Executed),
            "FAILED" => Ok(Self::Failed),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            "IGNORED" => Ok(Self::Ignored),
            other => Err(ParseAuditStateError(other.to_string())),
        }
    }
}

/// Marker written once a legacy history source has been imported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMarker {
    /// Name of the legacy source
    pub source: String,

    /// When the import completed
    pub imported_at: DateTime<Utc>,

    /// Entries written by the import
    pub imported_count: usize,

    /// Legacy records not written (conflicts, ignored records)
    pub skipped_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entry_serialization_uses_schema_names() {
        let entry = AuditEntry::new(
            "c1",
            "init",
            AuditState::Executed,
            "dev",
            Some("abc".to_string()),
            "run-1",
        )
        .with_duration(1500);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["changeId"], "c1");
        assert_eq!(json["state"], "EXECUTED");
        assert_eq!(json["durationMillis"], 1500);
        assert!(json["error"].is_null());

        let parsed: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_entry_with_error() {
        let entry = AuditEntry::new("c1", "init", AuditState::Failed, "dev", None, "run-1")
            .with_error("Connection timeout");

        assert_eq!(entry.error, Some("Connection timeout".to_string()));
    }

    #[test]
    fn test_newer_breaks_ties_by_sequence() {
        let now = Utc::now();
        let mut first = AuditEntry::new("c1", "s", AuditState::Pending, "a", None, "r")
            .with_timestamp(now);
        let mut second = AuditEntry::new("c1", "s", AuditState::Executed, "a", None, "r")
            .with_timestamp(now);
        first.sequence = 1;
        second.sequence = 2;

        assert!(second.is_newer_than(&first));
        assert!(!first.is_newer_than(&second));

        let older = second.clone().with_timestamp(now - Duration::seconds(5));
        assert!(first.is_newer_than(&older));
    }

    #[test]
    fn test_state_round_trip_through_str() {
        for state in [
            AuditState::Pending,
            AuditState::Executed,
            AuditState::Failed,
            AuditState::RolledBack,
            AuditState::Ignored,
        ] {
            assert_eq!(state.as_str().parse::<AuditState>().unwrap(), state);
        }
        assert!("DONE".parse::<AuditState>().is_err());
    }
}

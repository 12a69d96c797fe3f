//! Operator resolution of audit issues.
//!
//! A change left PENDING or FAILED blocks further runs until someone
//! inspects the target system and records what actually happened.

use tracing::info;
use uuid::Uuid;

use super::{AuditError, AuditStore};
use crate::domain::{AuditEntry, AuditState};

/// Author recorded on entries written by a manual fix
pub const FIX_AUTHOR: &str = "changeflow-cli";

/// What the operator determined about the change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The change is fully present in the target system
    Applied,

    /// The change left no trace (or was undone by hand)
    RolledBack,
}

impl Resolution {
    fn state(self) -> AuditState {
        match self {
            Self::Applied => AuditState::Executed,
            Self::RolledBack => AuditState::RolledBack,
        }
    }
}

/// Result of a fix attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// A resolving entry was written
    Fixed(AuditEntry),

    /// The change has no Pending or Failed latest entry
    NoIssueFound,
}

/// Record a manual resolution for a change with an outstanding issue.
///
/// `checksum` replaces the recorded checksum when the operator resolves
/// the change as applied against an updated definition.
pub async fn fix_entry(
    store: &dyn AuditStore,
    change_id: &str,
    resolution: Resolution,
    checksum: Option<String>,
) -> Result<FixOutcome, AuditError> {
    let latest = match store.latest_entry(change_id).await? {
        Some(entry) if entry.state.needs_attention() => entry,
        _ => return Ok(FixOutcome::NoIssueFound),
    };

    let mut entry = AuditEntry::new(
        change_id,
        latest.stage.clone(),
        resolution.state(),
        FIX_AUTHOR,
        checksum.or(latest.checksum.clone()),
        Uuid::new_v4().to_string(),
    );
    entry.target_system = latest.target_system.clone();

    // The fix must become the latest entry even if the clock went backwards.
    if entry.timestamp < latest.timestamp {
        entry.timestamp = latest.timestamp;
    }

    let sequence = store.append(&entry).await?;
    entry.sequence = sequence;

    info!(
        change_id,
        from = %latest.state,
        to = %entry.state,
        "Audit issue resolved manually"
    );
    Ok(FixOutcome::Fixed(entry))
}

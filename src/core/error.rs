//! Pipeline-level errors.

use thiserror::Error;

use crate::audit::AuditError;
use crate::domain::DefinitionError;
use crate::legacy::ImportError;
use crate::lock::LockError;

/// Why a pipeline run (or maintenance operation) stopped
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Change '{change_id}' targets unregistered system '{target_system}'")]
    UnknownTargetSystem {
        change_id: String,
        target_system: String,
    },

    #[error("Checksum drift on change '{change_id}' in stage '{stage}': audited {recorded}, definition has {current}")]
    ChecksumDrift {
        change_id: String,
        stage: String,
        recorded: String,
        current: String,
    },

    #[error("Pipeline lock busy: {0}")]
    LockBusy(LockError),

    #[error("Pipeline lock lost: {0}")]
    LockExpired(LockError),

    #[error("Pipeline lock backend failed: {0}")]
    LockBackend(LockError),

    #[error("Change '{change_id}' failed: {message}")]
    Execution { change_id: String, message: String },

    #[error("Rollback of change '{change_id}' failed: {message}")]
    Rollback { change_id: String, message: String },

    #[error("Audit write failed: {0}")]
    AuditWrite(#[from] AuditError),

    #[error("Legacy import failed: {0}")]
    Import(#[from] ImportError),

    #[error("Manual intervention required in stage '{stage}' for: {}", .change_ids.join(", "))]
    ManualInterventionRequired {
        stage: String,
        change_ids: Vec<String>,
    },

    #[error("Run cancelled: {0}")]
    Cancelled(String),
}

impl From<LockError> for PipelineError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Busy { .. } => Self::LockBusy(error),
            LockError::LeaseExpired { .. } => Self::LockExpired(error),
            _ => Self::LockBackend(error),
        }
    }
}

impl PipelineError {
    /// Change the error is attributed to, if any
    pub fn change_id(&self) -> Option<&str> {
        match self {
            Self::UnknownTargetSystem { change_id, .. }
            | Self::ChecksumDrift { change_id, .. }
            | Self::Execution { change_id, .. }
            | Self::Rollback { change_id, .. } => Some(change_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_are_classified() {
        let busy = LockError::Busy {
            key: "k".into(),
            owner: "other".into(),
            expires_at: chrono::Utc::now(),
        };
        assert!(matches!(PipelineError::from(busy), PipelineError::LockBusy(_)));

        let expired = LockError::LeaseExpired {
            key: "k".into(),
            token: 3,
        };
        assert!(matches!(
            PipelineError::from(expired),
            PipelineError::LockExpired(_)
        ));
    }

    #[test]
    fn test_manual_intervention_message_lists_changes() {
        let err = PipelineError::ManualInterventionRequired {
            stage: "data".into(),
            change_ids: vec!["c1".into(), "c2".into()],
        };
        assert_eq!(
            err.to_string(),
            "Manual intervention required in stage 'data' for: c1, c2"
        );
    }
}

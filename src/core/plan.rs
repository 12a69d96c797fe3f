//! Deciding what each change unit needs, from its latest audit entry.

use crate::adapters::TargetSystemRegistry;
use crate::audit::AuditSnapshot;
use crate::domain::{AuditEntry, AuditState, ChangeUnit, PipelineDefinition, RecoveryStrategy};

use super::error::PipelineError;

/// What the executor must do with a change unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    /// Run it
    Apply,

    /// Already applied with the same checksum
    Skip,

    /// Applied with a different checksum
    Drift { recorded: String, current: String },

    /// Left in an uncertain state; an operator must resolve it
    ManualIntervention { state: AuditState },
}

/// Resolve the action for one change.
///
/// `transactional` is the effective flag: the change asks for a
/// transaction and its target system supports one.
pub fn resolve_action(
    change: &ChangeUnit,
    transactional: bool,
    latest: Option<&AuditEntry>,
) -> ChangeAction {
    let Some(entry) = latest else {
        return ChangeAction::Apply;
    };

    let retry = change.recovery == RecoveryStrategy::AlwaysRetry;

    match entry.state {
        AuditState::Executed => match &entry.checksum {
            Some(recorded) if *recorded != change.checksum => ChangeAction::Drift {
                recorded: recorded.clone(),
                current: change.checksum.clone(),
            },
            _ => ChangeAction::Skip,
        },
        AuditState::RolledBack | AuditState::Ignored => ChangeAction::Apply,
        AuditState::Failed if transactional || retry => ChangeAction::Apply,
        AuditState::Pending if retry => ChangeAction::Apply,
        state @ (AuditState::Failed | AuditState::Pending) => {
            ChangeAction::ManualIntervention { state }
        }
    }
}

/// Whether a change will run inside a target transaction
pub fn is_effectively_transactional(change: &ChangeUnit, registry: &TargetSystemRegistry) -> bool {
    change.transactional
        && registry
            .get(&change.target_system)
            .is_some_and(|system| system.is_transactional())
}

/// Action decided for one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub stage: String,
    pub change_id: String,
    pub action: ChangeAction,
}

/// Actions for every change of a definition, in definition order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    pub changes: Vec<PlannedChange>,
}

impl ExecutionPlan {
    pub fn build(
        definition: &PipelineDefinition,
        snapshot: &AuditSnapshot,
        registry: &TargetSystemRegistry,
    ) -> Self {
        let changes = definition
            .changes()
            .map(|(stage, change)| PlannedChange {
                stage: stage.name.clone(),
                change_id: change.id.clone(),
                action: resolve_action(
                    change,
                    is_effectively_transactional(change, registry),
                    snapshot.get(&change.id),
                ),
            })
            .collect();

        Self { changes }
    }

    pub fn action(&self, change_id: &str) -> Option<&ChangeAction> {
        self.changes
            .iter()
            .find(|c| c.change_id == change_id)
            .map(|c| &c.action)
    }

    /// Whether any change has to run
    pub fn needs_work(&self) -> bool {
        self.changes
            .iter()
            .any(|c| !matches!(c.action, ChangeAction::Skip))
    }

    /// Ids of changes that will run
    pub fn to_apply(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Apply)
            .map(|c| c.change_id.as_str())
            .collect()
    }

    /// Fail on the first stage holding drifted or blocked changes
    pub fn check(&self) -> Result<(), PipelineError> {
        let mut stages: Vec<&str> = Vec::new();
        for change in &self.changes {
            if stages.last() != Some(&change.stage.as_str()) {
                stages.push(&change.stage);
            }
        }

        for stage in stages {
            let in_stage = self.changes.iter().filter(|c| c.stage == stage);

            if let Some((change, recorded, current)) = in_stage.clone().find_map(|c| match &c.action {
                ChangeAction::Drift { recorded, current } => Some((c, recorded, current)),
                _ => None,
            }) {
                return Err(PipelineError::ChecksumDrift {
                    change_id: change.change_id.clone(),
                    stage: change.stage.clone(),
                    recorded: recorded.clone(),
                    current: current.clone(),
                });
            }

            let blocked: Vec<String> = in_stage
                .filter(|c| matches!(c.action, ChangeAction::ManualIntervention { .. }))
                .map(|c| c.change_id.clone())
                .collect();
            if !blocked.is_empty() {
                return Err(PipelineError::ManualInterventionRequired {
                    stage: stage.to_string(),
                    change_ids: blocked,
                });
            }
        }

        Ok(())
    }

    /// Changes whose action differs between two plans
    pub fn differences(&self, other: &ExecutionPlan) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| other.action(&c.change_id) != Some(&c.action))
            .map(|c| c.change_id.clone())
            .collect()
    }
}

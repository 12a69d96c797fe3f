//! Run results reported back to the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::PipelineError;
use crate::domain::PipelineDefinition;

/// Terminal outcome of a change unit in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// Applied in this run
    Executed,

    /// Already applied, nothing done
    Ignored,

    /// Attempted and failed
    Failed,

    /// Failed, then compensated by its rollback
    RolledBack,

    /// Never started (run halted or aborted before it)
    NotStarted,
}

impl fmt::Display for ChangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executed => "executed",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
            Self::NotStarted => "not started",
        };
        f.pad(s)
    }
}

/// Per-change line of a run result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeReport {
    pub change_id: String,
    pub stage: String,
    pub outcome: ChangeOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ChangeReport {
    pub fn new(change_id: impl Into<String>, stage: impl Into<String>, outcome: ChangeOutcome) -> Self {
        Self {
            change_id: change_id.into(),
            stage: stage.into(),
            outcome,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every change executed or was already applied
    Completed,

    /// Finished, but some non-transactional changes failed under
    /// the continue-on-failure policy
    CompletedWithFailures,

    /// Halted by an error
    Failed,
}

/// Result of `Engine::run_pipeline`
#[derive(Debug)]
pub struct PipelineResult {
    pub execution_id: String,
    pub status: RunStatus,
    pub changes: Vec<ChangeReport>,
    pub error: Option<PipelineError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    fn with_outcome(&self, outcome: ChangeOutcome) -> Vec<&ChangeReport> {
        self.changes.iter().filter(|c| c.outcome == outcome).collect()
    }

    pub fn executed(&self) -> Vec<&ChangeReport> {
        self.with_outcome(ChangeOutcome::Executed)
    }

    pub fn ignored(&self) -> Vec<&ChangeReport> {
        self.with_outcome(ChangeOutcome::Ignored)
    }

    /// Changes that failed, including those compensated by a rollback
    pub fn failed(&self) -> Vec<&ChangeReport> {
        self.changes
            .iter()
            .filter(|c| matches!(c.outcome, ChangeOutcome::Failed | ChangeOutcome::RolledBack))
            .collect()
    }

    pub fn not_started(&self) -> Vec<&ChangeReport> {
        self.with_outcome(ChangeOutcome::NotStarted)
    }

    /// Report for one change
    pub fn change(&self, change_id: &str) -> Option<&ChangeReport> {
        self.changes.iter().find(|c| c.change_id == change_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let status = match self.status {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed with failures",
            RunStatus::Failed => "failed",
        };
        let mut summary = format!(
            "Run {} {}: {} executed, {} ignored, {} failed, {} not started ({}ms)",
            self.execution_id,
            status,
            self.executed().len(),
            self.ignored().len(),
            self.failed().len(),
            self.not_started().len(),
            self.duration_ms()
        );
        if let Some(error) = &self.error {
            summary.push_str(&format!(": {}", error));
        }
        summary
    }

    /// Turn a failed run into its error
    pub fn into_result(self) -> Result<Self, PipelineError> {
        match self.status {
            RunStatus::Failed => Err(self.error.unwrap_or_else(|| {
                PipelineError::Cancelled("run failed without a recorded error".to_string())
            })),
            _ => Ok(self),
        }
    }
}

/// Accumulates change reports while a run progresses
pub(crate) struct RunRecorder {
    execution_id: String,
    started_at: DateTime<Utc>,
    changes: Vec<ChangeReport>,
}

impl RunRecorder {
    /// Every change of the definition starts as NotStarted
    pub(crate) fn new(execution_id: impl Into<String>, definition: &PipelineDefinition) -> Self {
        Self {
            execution_id: execution_id.into(),
            started_at: Utc::now(),
            changes: definition
                .changes()
                .map(|(stage, change)| {
                    ChangeReport::new(change.id.clone(), stage.name.clone(), ChangeOutcome::NotStarted)
                })
                .collect(),
        }
    }

    pub(crate) fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub(crate) fn record(&mut self, report: ChangeReport) {
        match self.changes.iter_mut().find(|c| c.change_id == report.change_id) {
            Some(slot) => *slot = report,
            None => self.changes.push(report),
        }
    }

    /// Mark every change not yet reported as Ignored
    pub(crate) fn ignore_remaining(&mut self) {
        for change in &mut self.changes {
            if change.outcome == ChangeOutcome::NotStarted {
                change.outcome = ChangeOutcome::Ignored;
            }
        }
    }

    pub(crate) fn finish(self, error: Option<PipelineError>) -> PipelineResult {
        let has_failures = self
            .changes
            .iter()
            .any(|c| matches!(c.outcome, ChangeOutcome::Failed | ChangeOutcome::RolledBack));

        let status = match (&error, has_failures) {
            (Some(_), _) => RunStatus::Failed,
            (None, true) => RunStatus::CompletedWithFailures,
            (None, false) => RunStatus::Completed,
        };

        PipelineResult {
            execution_id: self.execution_id,
            status,
            changes: self.changes,
            error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: RunStatus, error: Option<PipelineError>) -> PipelineResult {
        let now = Utc::now();
        PipelineResult {
            execution_id: "run-1".into(),
            status,
            changes: vec![
                ChangeReport::new("c1", "init", ChangeOutcome::Executed).with_duration(5),
                ChangeReport::new("c2", "init", ChangeOutcome::Ignored),
                ChangeReport::new("c3", "data", ChangeOutcome::RolledBack).with_error("boom"),
                ChangeReport::new("c4", "data", ChangeOutcome::NotStarted),
            ],
            error,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_summary_counts() {
        let result = result(RunStatus::CompletedWithFailures, None);
        assert_eq!(result.executed().len(), 1);
        assert_eq!(result.ignored().len(), 1);
        assert_eq!(result.failed().len(), 1);
        assert!(!result.is_success());
        assert!(result
            .summary()
            .contains("1 executed, 1 ignored, 1 failed, 1 not started"));
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_failed_run_into_error() {
        let err = PipelineError::Cancelled("stop requested".into());
        let result = result(RunStatus::Failed, Some(err));
        assert!(matches!(
            result.into_result(),
            Err(PipelineError::Cancelled(_))
        ));
    }
}

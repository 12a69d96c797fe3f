//! Pipeline executor.
//!
//! Plans a run from the audit log, takes the pipeline lock, and applies
//! every change that needs it, stage by stage, writing audit entries as it
//! goes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterError, AuditWrite, TargetSystem, TargetSystemRegistry};
use crate::audit::{fix_entry, AuditSnapshot, AuditStore, FixOutcome, Resolution};
use crate::domain::{
    AuditEntry, AuditState, ChangeUnit, DefinitionError, PipelineDefinition, Stage,
};
use crate::lock::{DistributedLock, LeaseGuard};

use super::error::PipelineError;
use super::plan::{is_effectively_transactional, resolve_action, ChangeAction, ExecutionPlan};
use super::result::{ChangeOutcome, ChangeReport, PipelineResult, RunRecorder};
use super::retry::{append_with_retry, RetryPolicy};

/// What to do when a non-transactional change fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the pipeline on the first failure
    #[default]
    FailFast,

    /// Record the failure and keep going; transactional failures still halt
    ContinueOnNonTransactionalFailure,
}

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Lock acquisition timeout (falls back to the lock configuration)
    pub lock_timeout: Option<Duration>,

    /// Upper bound on concurrency inside bounded-parallel stages
    pub max_parallelism: Option<usize>,

    pub failure_policy: FailurePolicy,

    /// Import the legacy audit source before running
    pub legacy_import: bool,
}

impl RunOptions {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_max_parallelism(mut self, limit: usize) -> Self {
        self.max_parallelism = Some(limit);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_legacy_import(mut self, enabled: bool) -> Self {
        self.legacy_import = enabled;
        self
    }
}

/// Cooperative cancellation flag, checked before each change starts
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a change task needs; cheap to clone into spawned tasks
#[derive(Clone)]
struct UnitContext {
    audit: Arc<dyn AuditStore>,
    registry: Arc<TargetSystemRegistry>,
    retry: RetryPolicy,
    execution_id: String,
    policy: FailurePolicy,
}

/// Result of one change
struct UnitResult {
    report: ChangeReport,
    error: Option<PipelineError>,
    halts: bool,
}

impl UnitResult {
    fn ok(report: ChangeReport) -> Self {
        Self {
            report,
            error: None,
            halts: false,
        }
    }

    fn halt(report: ChangeReport, error: PipelineError) -> Self {
        Self {
            report,
            error: Some(error),
            halts: true,
        }
    }
}

/// Applies pipeline definitions against registered target systems
pub struct Executor {
    audit: Arc<dyn AuditStore>,
    registry: Arc<TargetSystemRegistry>,
    lock: DistributedLock,
    retry: RetryPolicy,
    owner: String,
    stop: StopHandle,
}

impl Executor {
    pub fn new(
        audit: Arc<dyn AuditStore>,
        registry: TargetSystemRegistry,
        lock: DistributedLock,
    ) -> Self {
        Self {
            audit,
            registry: Arc::new(registry),
            lock,
            retry: RetryPolicy::default(),
            owner: format!("changeflow-{}", Uuid::new_v4()),
            stop: StopHandle::default(),
        }
    }

    /// Retry policy for transient audit failures
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lock owner name for this instance
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn registry(&self) -> &TargetSystemRegistry {
        &self.registry
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Handle that stops the run before the next change starts
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Check the definition and its target system references
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<(), PipelineError> {
        definition.validate()?;

        for (_, change) in definition.changes() {
            let system = self.registry.get(&change.target_system).ok_or_else(|| {
                PipelineError::UnknownTargetSystem {
                    change_id: change.id.clone(),
                    target_system: change.target_system.clone(),
                }
            })?;

            if change.transactional && !system.is_transactional() {
                return Err(DefinitionError::Invalid(format!(
                    "Change '{}' is transactional but target system '{}' is not",
                    change.id, change.target_system
                ))
                .into());
            }
        }

        Ok(())
    }

    async fn plan(&self, definition: &PipelineDefinition) -> Result<ExecutionPlan, PipelineError> {
        let snapshot = AuditSnapshot::load(self.audit.as_ref()).await?;
        Ok(ExecutionPlan::build(definition, &snapshot, &self.registry))
    }

    /// Run a pipeline definition to completion or first halting failure
    #[instrument(skip(self, definition, options), fields(changes = definition.change_count()))]
    pub async fn run(&self, definition: &PipelineDefinition, options: &RunOptions) -> PipelineResult {
        let mut run = RunRecorder::new(Uuid::new_v4().to_string(), definition);
        info!(execution_id = %run.execution_id(), "Starting pipeline run");

        if let Err(e) = self.validate(definition) {
            error!(error = %e, "Pipeline definition rejected");
            return run.finish(Some(e));
        }

        // Optimistic read: skip the lock entirely when nothing needs doing
        let optimistic = match self.plan(definition).await {
            Ok(plan) => plan,
            Err(e) => return run.finish(Some(e)),
        };
        if !optimistic.needs_work() {
            info!("All changes already applied");
            run.ignore_remaining();
            return run.finish(None);
        }

        let timeout = options
            .lock_timeout
            .unwrap_or(self.lock.config().acquire_timeout);
        let guard = match self.lock.acquire_with_timeout(&self.owner, timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "Could not acquire pipeline lock");
                return run.finish(Some(e.into()));
            }
        };

        let outcome = self
            .run_locked(definition, options, &optimistic, &guard, &mut run)
            .await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release pipeline lock");
        }

        let result = run.finish(outcome.err());
        match &result.error {
            Some(e) => error!(error = %e, "Pipeline run failed"),
            None => info!(status = ?result.status, "{}", result.summary()),
        }
        result
    }

    async fn run_locked(
        &self,
        definition: &PipelineDefinition,
        options: &RunOptions,
        optimistic: &ExecutionPlan,
        guard: &LeaseGuard,
        run: &mut RunRecorder,
    ) -> Result<(), PipelineError> {
        let plan = self.plan(definition).await?;

        let changed = plan.differences(optimistic);
        if !changed.is_empty() {
            info!(changes = ?changed, "Audit state changed while waiting for the lock");
        }

        plan.check()?;

        if !plan.needs_work() {
            info!("Another instance applied the pending changes");
            run.ignore_remaining();
            return Ok(());
        }

        let ctx = UnitContext {
            audit: Arc::clone(&self.audit),
            registry: Arc::clone(&self.registry),
            retry: self.retry.clone(),
            execution_id: run.execution_id().to_string(),
            policy: options.failure_policy,
        };

        for stage in &definition.stages {
            let limit = stage.concurrency_limit(options.max_parallelism);
            info!(stage = %stage.name, limit, "Running stage");

            if limit <= 1 {
                self.run_sequential(&ctx, stage, &plan, guard, run).await?;
            } else {
                self.run_parallel(&ctx, stage, limit, &plan, guard, run)
                    .await?;
            }
        }

        Ok(())
    }

    /// Checkpoint before a change starts
    async fn checkpoint(&self, guard: &LeaseGuard) -> Result<(), PipelineError> {
        if self.stop.is_stopped() {
            return Err(PipelineError::Cancelled(
                "stop requested before next change".to_string(),
            ));
        }
        guard.ensure_current().await?;
        Ok(())
    }

    async fn run_sequential(
        &self,
        ctx: &UnitContext,
        stage: &Stage,
        plan: &ExecutionPlan,
        guard: &LeaseGuard,
        run: &mut RunRecorder,
    ) -> Result<(), PipelineError> {
        for change in &stage.changes {
            if plan.action(&change.id) == Some(&ChangeAction::Skip) {
                run.record(ChangeReport::new(&change.id, &stage.name, ChangeOutcome::Ignored));
                continue;
            }

            self.checkpoint(guard).await?;

            let result = execute_unit(ctx, &stage.name, change).await;
            run.record(result.report);
            if let Some(e) = result.error {
                if result.halts {
                    return Err(e);
                }
                warn!(change_id = %change.id, error = %e, "Continuing after failure");
            }
        }

        Ok(())
    }

    async fn run_parallel(
        &self,
        ctx: &UnitContext,
        stage: &Stage,
        limit: usize,
        plan: &ExecutionPlan,
        guard: &LeaseGuard,
        run: &mut RunRecorder,
    ) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(limit));
        let halted = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut dispatch_error = None;

        for change in &stage.changes {
            if plan.action(&change.id) == Some(&ChangeAction::Skip) {
                run.record(ChangeReport::new(&change.id, &stage.name, ChangeOutcome::Ignored));
                continue;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if halted.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.checkpoint(guard).await {
                dispatch_error = Some(e);
                break;
            }

            let ctx = ctx.clone();
            let stage_name = stage.name.clone();
            let change = change.clone();
            let halted = Arc::clone(&halted);
            let change_id = change.id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = execute_unit(&ctx, &stage_name, &change).await;
                if result.halts {
                    halted.store(true, Ordering::SeqCst);
                }
                result
            });
            handles.push((change_id, handle));
        }

        // Started changes always finish; the first halting failure in
        // definition order wins.
        let mut first_error = None;
        for (change_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let message = format!("change task aborted: {}", e);
                    UnitResult::halt(
                        ChangeReport::new(&change_id, &stage.name, ChangeOutcome::Failed)
                            .with_error(message.clone()),
                        PipelineError::Execution { change_id, message },
                    )
                }
            };

            run.record(result.report);
            if let Some(e) = result.error {
                if result.halts && first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "Continuing after failure");
                }
            }
        }

        match first_error.or(dispatch_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back a single change by hand, under the pipeline lock
    #[instrument(skip(self, definition))]
    pub async fn rollback_change(
        &self,
        definition: &PipelineDefinition,
        change_id: &str,
    ) -> Result<ChangeReport, PipelineError> {
        let rollback_error = |message: String| PipelineError::Rollback {
            change_id: change_id.to_string(),
            message,
        };

        let (stage, change) = definition
            .find_change(change_id)
            .ok_or_else(|| rollback_error("change is not in the definition".to_string()))?;
        if change.rollback.is_none() {
            return Err(rollback_error("change declares no rollback".to_string()));
        }
        let system = self.registry.get(&change.target_system).ok_or_else(|| {
            PipelineError::UnknownTargetSystem {
                change_id: change.id.clone(),
                target_system: change.target_system.clone(),
            }
        })?;

        let guard = self.lock.acquire(&self.owner).await?;
        let outcome = self
            .rollback_locked(&stage.name, change, system.as_ref(), &guard)
            .await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release pipeline lock");
        }
        outcome
    }

    /// Record an operator resolution for a change, under the pipeline lock
    #[instrument(skip(self, checksum))]
    pub async fn fix_change(
        &self,
        change_id: &str,
        resolution: Resolution,
        checksum: Option<String>,
    ) -> Result<FixOutcome, PipelineError> {
        let guard = self.lock.acquire(&self.owner).await?;

        let outcome = match guard.ensure_current().await {
            Ok(()) => fix_entry(self.audit.as_ref(), change_id, resolution, checksum)
                .await
                .map_err(PipelineError::from),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release pipeline lock");
        }
        outcome
    }

    async fn rollback_locked(
        &self,
        stage: &str,
        change: &ChangeUnit,
        system: &dyn TargetSystem,
        guard: &LeaseGuard,
    ) -> Result<ChangeReport, PipelineError> {
        guard.ensure_current().await?;

        let state = self
            .audit
            .latest_entry(&change.id)
            .await?
            .map(|entry| entry.state);
        match state {
            Some(AuditState::Executed | AuditState::Failed | AuditState::Pending) => {}
            other => {
                return Err(PipelineError::Rollback {
                    change_id: change.id.clone(),
                    message: match other {
                        Some(state) => format!("nothing to roll back (latest state {})", state),
                        None => "change was never applied".to_string(),
                    },
                });
            }
        }

        let started = Instant::now();
        system
            .rollback(change)
            .await
            .map_err(|e| PipelineError::Rollback {
                change_id: change.id.clone(),
                message: e.to_string(),
            })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = AuditEntry::for_change(
            change,
            stage,
            AuditState::RolledBack,
            &Uuid::new_v4().to_string(),
        )
        .with_duration(duration_ms);
        append_with_retry(self.audit.as_ref(), &entry, &self.retry).await?;

        info!(change_id = %change.id, "Change rolled back manually");
        Ok(ChangeReport::new(&change.id, stage, ChangeOutcome::RolledBack).with_duration(duration_ms))
    }
}

/// Apply one change, re-checking its latest audit entry first
async fn execute_unit(ctx: &UnitContext, stage: &str, change: &ChangeUnit) -> UnitResult {
    let report = |outcome| ChangeReport::new(&change.id, stage, outcome);

    let latest = match ctx.audit.latest_entry(&change.id).await {
        Ok(latest) => latest,
        Err(e) => {
            return UnitResult::halt(
                report(ChangeOutcome::NotStarted).with_error(e.to_string()),
                e.into(),
            )
        }
    };

    let Some(system) = ctx.registry.get(&change.target_system) else {
        return UnitResult::halt(
            report(ChangeOutcome::NotStarted),
            PipelineError::UnknownTargetSystem {
                change_id: change.id.clone(),
                target_system: change.target_system.clone(),
            },
        );
    };
    let transactional = is_effectively_transactional(change, &ctx.registry);

    match resolve_action(change, transactional, latest.as_ref()) {
        ChangeAction::Apply => {}
        ChangeAction::Skip => {
            debug!(change_id = %change.id, "Already applied");
            return UnitResult::ok(report(ChangeOutcome::Ignored));
        }
        ChangeAction::Drift { recorded, current } => {
            return UnitResult::halt(
                report(ChangeOutcome::NotStarted),
                PipelineError::ChecksumDrift {
                    change_id: change.id.clone(),
                    stage: stage.to_string(),
                    recorded,
                    current,
                },
            );
        }
        ChangeAction::ManualIntervention { .. } => {
            return UnitResult::halt(
                report(ChangeOutcome::NotStarted),
                PipelineError::ManualInterventionRequired {
                    stage: stage.to_string(),
                    change_ids: vec![change.id.clone()],
                },
            );
        }
    }

    info!(change_id = %change.id, stage, transactional, "Applying change");

    if transactional {
        execute_transactional(ctx, stage, change, system.as_ref()).await
    } else {
        execute_non_transactional(ctx, stage, change, system.as_ref()).await
    }
}

async fn execute_transactional(
    ctx: &UnitContext,
    stage: &str,
    change: &ChangeUnit,
    system: &dyn TargetSystem,
) -> UnitResult {
    let started = Instant::now();
    let audit = Arc::clone(&ctx.audit);
    let retry = ctx.retry.clone();
    let execution_id = ctx.execution_id.as_str();

    let audit_write: AuditWrite<'_> = Box::pin(async move {
        let entry = AuditEntry::for_change(change, stage, AuditState::Executed, execution_id)
            .with_duration(started.elapsed().as_millis() as u64);
        append_with_retry(audit.as_ref(), &entry, &retry)
            .await
            .map(|_| ())
    });

    let result = system.run_in_transaction(change, audit_write).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let report = ChangeReport::new(&change.id, stage, ChangeOutcome::Executed).with_duration(duration_ms);

    match result {
        Ok(()) => {
            info!(change_id = %change.id, duration_ms, "Change applied");
            UnitResult::ok(report)
        }
        Err(AdapterError::CommitFailed(message)) => {
            // The Executed entry is durable but the change is not; supersede it
            error!(change_id = %change.id, error = %message, "Commit failed after audit write");
            let failed = AuditEntry::for_change(change, stage, AuditState::Failed, execution_id)
                .with_duration(duration_ms)
                .with_error(format!("commit failed: {}", message));
            let mut report = report.with_error(message.clone());
            report.outcome = ChangeOutcome::Failed;

            if let Err(e) = append_with_retry(ctx.audit.as_ref(), &failed, &ctx.retry).await {
                error!(change_id = %change.id, error = %e, "Could not record failed commit");
                return UnitResult::halt(report, PipelineError::AuditWrite(e));
            }
            UnitResult::halt(
                report,
                PipelineError::Execution {
                    change_id: change.id.clone(),
                    message: format!("commit failed: {}", message),
                },
            )
        }
        Err(AdapterError::AuditWrite(e)) => {
            error!(change_id = %change.id, error = %e, "Audit write failed, transaction rolled back");
            let mut report = report.with_error(e.to_string());
            report.outcome = ChangeOutcome::Failed;
            UnitResult::halt(report, PipelineError::AuditWrite(e))
        }
        Err(e) => {
            error!(change_id = %change.id, error = %e, "Change failed, transaction rolled back");
            let mut report = report.with_error(e.to_string());
            report.outcome = ChangeOutcome::Failed;
            UnitResult::halt(
                report,
                PipelineError::Execution {
                    change_id: change.id.clone(),
                    message: e.to_string(),
                },
            )
        }
    }
}

async fn execute_non_transactional(
    ctx: &UnitContext,
    stage: &str,
    change: &ChangeUnit,
    system: &dyn TargetSystem,
) -> UnitResult {
    let entry = |state| AuditEntry::for_change(change, stage, state, &ctx.execution_id);
    let report = |outcome, duration_ms| {
        ChangeReport::new(&change.id, stage, outcome).with_duration(duration_ms)
    };
    let audit_failed = |outcome, duration_ms, e: crate::audit::AuditError| {
        error!(change_id = %change.id, error = %e, "Audit write failed");
        UnitResult::halt(
            report(outcome, duration_ms).with_error(e.to_string()),
            PipelineError::AuditWrite(e),
        )
    };

    if let Err(e) = append_with_retry(ctx.audit.as_ref(), &entry(AuditState::Pending), &ctx.retry).await {
        return audit_failed(ChangeOutcome::NotStarted, 0, e);
    }

    let started = Instant::now();
    let result = system.execute(change).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let failure = match result {
        Ok(()) => {
            let executed = entry(AuditState::Executed).with_duration(duration_ms);
            if let Err(e) = append_with_retry(ctx.audit.as_ref(), &executed, &ctx.retry).await {
                return audit_failed(ChangeOutcome::Failed, duration_ms, e);
            }
            info!(change_id = %change.id, duration_ms, "Change applied");
            return UnitResult::ok(report(ChangeOutcome::Executed, duration_ms));
        }
        Err(e) => e.to_string(),
    };

    error!(change_id = %change.id, error = %failure, "Change failed");
    let failed = entry(AuditState::Failed)
        .with_duration(duration_ms)
        .with_error(failure.clone());
    if let Err(e) = append_with_retry(ctx.audit.as_ref(), &failed, &ctx.retry).await {
        return audit_failed(ChangeOutcome::Failed, duration_ms, e);
    }

    let tolerated = ctx.policy == FailurePolicy::ContinueOnNonTransactionalFailure;
    let execution_error = PipelineError::Execution {
        change_id: change.id.clone(),
        message: failure.clone(),
    };

    if change.rollback.is_none() {
        return UnitResult {
            report: report(ChangeOutcome::Failed, duration_ms).with_error(failure),
            error: Some(execution_error),
            halts: !tolerated,
        };
    }

    match system.rollback(change).await {
        Ok(()) => {
            let rolled_back = entry(AuditState::RolledBack)
                .with_duration(duration_ms)
                .with_error(failure.clone());
            if let Err(e) = append_with_retry(ctx.audit.as_ref(), &rolled_back, &ctx.retry).await {
                return audit_failed(ChangeOutcome::Failed, duration_ms, e);
            }
            info!(change_id = %change.id, "Failed change rolled back");
            UnitResult {
                report: report(ChangeOutcome::RolledBack, duration_ms).with_error(failure),
                error: Some(execution_error),
                halts: !tolerated,
            }
        }
        Err(rollback_err) => {
            error!(change_id = %change.id, error = %rollback_err, "Rollback failed");
            UnitResult {
                report: report(ChangeOutcome::Failed, duration_ms)
                    .with_error(format!("{}; rollback failed: {}", failure, rollback_err)),
                error: Some(PipelineError::Rollback {
                    change_id: change.id.clone(),
                    message: rollback_err.to_string(),
                }),
                halts: !tolerated,
            }
        }
    }
}

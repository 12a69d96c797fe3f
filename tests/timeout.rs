//! Timeout Integration Tests
//!
//! Retry backoff for transient audit failures and time-bounded shell
//! changes.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use changeflow::adapters::{InMemoryTargetSystem, ShellTargetSystem};
use changeflow::core::{ChangeOutcome, PipelineError, RetryPolicy, RunOptions, RunStatus};
use changeflow::domain::{ChangeUnit, PipelineDefinition, Stage};
use changeflow::lock::InMemoryLockStore;

use common::{executor_with, memory_executor, system, FlakyAuditStore};

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    }
}

fn single(change: ChangeUnit) -> PipelineDefinition {
    PipelineDefinition::new(vec![Stage::sequential("init", vec![change])])
}

#[test]
fn test_retry_policy_from_yaml_uses_defaults() {
    let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();

    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(2000));
}

#[tokio::test]
async fn test_transient_audit_failures_are_retried() {
    let kv = Arc::new(InMemoryTargetSystem::new("kv"));
    let audit = Arc::new(FlakyAuditStore::new());
    let executor = executor_with(audit.clone(), Arc::new(InMemoryLockStore::new()), vec![system(&kv)])
        .with_retry_policy(quick_retry());
    audit.fail_next(2);

    let result = executor
        .run(&single(ChangeUnit::new("c1", 1, "kv", "set a 1")), &RunOptions::default())
        .await;

    assert!(result.is_success());
    // Two failed attempts, then Pending and Executed
    assert_eq!(audit.append_attempts(), 4);
    assert_eq!(audit.entries().await.len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_stop_before_execution() {
    let kv = Arc::new(InMemoryTargetSystem::new("kv"));
    let audit = Arc::new(FlakyAuditStore::new());
    let executor = executor_with(audit.clone(), Arc::new(InMemoryLockStore::new()), vec![system(&kv)])
        .with_retry_policy(quick_retry());
    audit.fail_next(10);

    let result = executor
        .run(&single(ChangeUnit::new("c1", 1, "kv", "set a 1")), &RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(result.error, Some(PipelineError::AuditWrite(_))));
    assert_eq!(result.change("c1").unwrap().outcome, ChangeOutcome::NotStarted);
    assert_eq!(audit.append_attempts(), 3);
    assert_eq!(kv.execution_count(), 0);
}

#[tokio::test]
async fn test_shell_change_times_out() {
    let shell = Arc::new(ShellTargetSystem::new("sh").with_timeout(Duration::from_millis(200)));
    let (executor, _) = memory_executor(vec![system(&shell)]);

    let started = Instant::now();
    let result = executor
        .run(&single(ChangeUnit::new("c1", 1, "sh", "sleep 5")), &RunOptions::default())
        .await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(result.status, RunStatus::Failed);
    let report = result.change("c1").unwrap();
    assert_eq!(report.outcome, ChangeOutcome::Failed);
    assert!(report.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_shell_change_sees_its_id() {
    let shell = Arc::new(ShellTargetSystem::new("sh"));
    let (executor, _) = memory_executor(vec![system(&shell)]);

    let result = executor
        .run(
            &single(ChangeUnit::new("c1", 1, "sh", "test \"$CHANGEFLOW_CHANGE_ID\" = c1")),
            &RunOptions::default(),
        )
        .await;
    assert!(result.is_success());
}

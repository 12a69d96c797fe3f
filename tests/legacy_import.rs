//! Legacy Import Integration Tests
//!
//! A legacy history is imported once, and imported changes are not
//! applied again.

mod common;

use std::sync::Arc;

use changeflow::adapters::InMemoryTargetSystem;
use changeflow::audit::{AuditStore, JsonlAuditStore};
use changeflow::core::{ChangeOutcome, Engine, RunOptions, RunStatus};
use changeflow::domain::{AuditState, ChangeUnit, PipelineDefinition, Stage};
use changeflow::legacy::{ImportResult, JsonlLegacySource, LegacyImporter, LEGACY_STAGE};
use changeflow::lock::InMemoryLockStore;
use tempfile::TempDir;

use common::{executor_with, system};

const LEGACY_LOG: &str = r#"{"executionId":"exec-1","changeId":"create-users","author":"alice","timestamp":1700000000000,"state":"EXECUTED","type":"EXECUTION","executionMillis":42,"systemChange":false}
{"executionId":"exec-1","changeId":"seed-users","author":"alice","timestamp":"2023-11-14T22:13:21Z","state":"FAILED","type":"EXECUTION","executionMillis":7,"errorTrace":"duplicate key","systemChange":false}
{"executionId":"exec-1","changeId":"seed-users","author":"alice","timestamp":"2023-11-14T22:13:20Z","state":"EXECUTED","type":"BEFORE_EXECUTION","systemChange":false}
{"executionId":"exec-0","changeId":"legacy-lock-table","timestamp":1699999999000,"state":"EXECUTED","systemChange":true}
{"executionId":"exec-2","changeId":"drop-temp","timestamp":1700000100000,"state":"IGNORED"}
"#;

fn write_legacy_log(temp: &TempDir) -> JsonlLegacySource {
    let path = temp.path().join("legacy.jsonl");
    std::fs::write(&path, LEGACY_LOG).unwrap();
    JsonlLegacySource::new("mongock", path)
}

fn definition() -> PipelineDefinition {
    PipelineDefinition::new(vec![Stage::sequential(
        "init",
        vec![
            ChangeUnit::new("create-users", 1, "kv", "set users table"),
            ChangeUnit::new("add-index", 2, "kv", "set users_idx email"),
        ],
    )])
}

#[tokio::test]
async fn test_import_twice_equals_once() {
    let temp = TempDir::new().unwrap();
    let source = write_legacy_log(&temp);
    let audit = Arc::new(JsonlAuditStore::open(temp.path().join("audit.jsonl")).await.unwrap());
    let importer = LegacyImporter::new(audit.clone());

    let first = importer.import_if_needed(&source, None).await.unwrap();
    assert_eq!(
        first,
        ImportResult::Imported {
            imported: 2,
            skipped_existing: 0,
            skipped_ignored: 3,
        }
    );
    let after_first = audit.replay().await.unwrap();

    let second = importer.import_if_needed(&source, None).await.unwrap();
    match second {
        ImportResult::AlreadyImported { marker } => {
            assert_eq!(marker.source, "mongock");
            assert_eq!(marker.imported_count, 2);
            assert_eq!(marker.skipped_count, 3);
        }
        other => panic!("expected AlreadyImported, got {:?}", other),
    }
    assert_eq!(audit.replay().await.unwrap(), after_first);

    let seed = audit.latest_entry("seed-users").await.unwrap().unwrap();
    assert_eq!(seed.state, AuditState::Failed);
    assert_eq!(seed.stage, LEGACY_STAGE);
    assert_eq!(seed.error.as_deref(), Some("duplicate key"));
    assert_eq!(seed.author, "alice");
    assert!(seed.checksum.is_none());
}

#[tokio::test]
async fn test_marker_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let source = write_legacy_log(&temp);
    let audit_path = temp.path().join("audit.jsonl");

    {
        let audit = Arc::new(JsonlAuditStore::open(&audit_path).await.unwrap());
        LegacyImporter::new(audit)
            .import_if_needed(&source, None)
            .await
            .unwrap();
    }

    let reopened = Arc::new(JsonlAuditStore::open(&audit_path).await.unwrap());
    let result = LegacyImporter::new(reopened.clone())
        .import_if_needed(&source, None)
        .await
        .unwrap();
    assert!(matches!(result, ImportResult::AlreadyImported { .. }));
    assert_eq!(reopened.replay().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_engine_imports_before_running() {
    let temp = TempDir::new().unwrap();
    let source = write_legacy_log(&temp);
    let audit = Arc::new(JsonlAuditStore::open(temp.path().join("audit.jsonl")).await.unwrap());
    let kv = Arc::new(InMemoryTargetSystem::new("kv"));

    let executor = executor_with(audit.clone(), Arc::new(InMemoryLockStore::new()), vec![system(&kv)]);
    let engine = Engine::new(executor).with_legacy_source(Arc::new(source));

    let options = RunOptions::default().with_legacy_import(true);
    let result = engine.run_pipeline(&definition(), &options).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(
        result.change("create-users").unwrap().outcome,
        ChangeOutcome::Ignored
    );
    assert_eq!(
        result.change("add-index").unwrap().outcome,
        ChangeOutcome::Executed
    );
    assert_eq!(kv.execution_count(), 1);
    assert_eq!(kv.get("users").await, None);

    // Stage resolved from the definition
    let imported = audit.latest_entry("create-users").await.unwrap().unwrap();
    assert_eq!(imported.stage, "init");
    assert_eq!(imported.duration_millis, 42);

    // A second run imports nothing and applies nothing
    let rerun = engine.run_pipeline(&definition(), &options).await;
    assert_eq!(rerun.ignored().len(), 2);
    assert_eq!(kv.execution_count(), 1);
}

#[tokio::test]
async fn test_run_without_import_flag_ignores_legacy_source() {
    let temp = TempDir::new().unwrap();
    let source = write_legacy_log(&temp);
    let audit = Arc::new(JsonlAuditStore::open(temp.path().join("audit.jsonl")).await.unwrap());
    let kv = Arc::new(InMemoryTargetSystem::new("kv"));

    let executor = executor_with(audit.clone(), Arc::new(InMemoryLockStore::new()), vec![system(&kv)]);
    let engine = Engine::new(executor).with_legacy_source(Arc::new(source));

    let result = engine.run_pipeline(&definition(), &RunOptions::default()).await;
    assert_eq!(result.executed().len(), 2);
    assert!(audit.import_marker("mongock").await.unwrap().is_none());
}

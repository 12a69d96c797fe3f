//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use changeflow::adapters::{TargetSystem, TargetSystemRegistry};
use changeflow::audit::{AuditError, AuditStore, InMemoryAuditStore};
use changeflow::core::{Executor, RetryPolicy};
use changeflow::domain::{AuditEntry, ImportMarker};
use changeflow::lock::{DistributedLock, InMemoryLockStore, LockConfig, LockStore};

/// Lock timings short enough for tests
pub fn fast_lock_config() -> LockConfig {
    LockConfig {
        lease_duration: Duration::from_millis(500),
        acquire_timeout: Duration::from_millis(200),
        retry_interval: Duration::from_millis(10),
        renew_interval: Duration::from_millis(100),
        ..LockConfig::default()
    }
}

/// Erase a concrete target system for the registry
pub fn system<T: TargetSystem + 'static>(system: &Arc<T>) -> Arc<dyn TargetSystem> {
    system.clone()
}

pub fn registry(systems: Vec<Arc<dyn TargetSystem>>) -> TargetSystemRegistry {
    systems
        .into_iter()
        .fold(TargetSystemRegistry::new(), |registry, system| registry.with(system))
}

/// Executor over shared audit and lock stores
pub fn executor_with(
    audit: Arc<dyn AuditStore>,
    lock_store: Arc<dyn LockStore>,
    systems: Vec<Arc<dyn TargetSystem>>,
) -> Executor {
    Executor::new(
        audit,
        registry(systems),
        DistributedLock::new(lock_store, fast_lock_config()),
    )
    .with_retry_policy(RetryPolicy::none())
}

/// Executor with fresh in-memory audit and lock stores
pub fn memory_executor(systems: Vec<Arc<dyn TargetSystem>>) -> (Executor, Arc<InMemoryAuditStore>) {
    let audit = Arc::new(InMemoryAuditStore::new());
    let executor = executor_with(audit.clone(), Arc::new(InMemoryLockStore::new()), systems);
    (executor, audit)
}

/// Audit store whose appends can be made to fail
#[derive(Default)]
pub struct FlakyAuditStore {
    inner: InMemoryAuditStore,
    failing: AtomicBool,
    /// Appends left to fail with a transient error before recovering
    transient_failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every append until turned off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` appends, then succeed
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn append_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.entries().await
    }
}

#[async_trait]
impl AuditStore for FlakyAuditStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn append(&self, entry: &AuditEntry) -> Result<u64, AuditError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Corrupt("store rejected the write".to_string()));
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(AuditError::Unavailable("connection reset".to_string()));
        }
        self.inner.append(entry).await
    }

    async fn latest_entry(&self, change_id: &str) -> Result<Option<AuditEntry>, AuditError> {
        self.inner.latest_entry(change_id).await
    }

    async fn all_latest_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.all_latest_entries().await
    }

    async fn history(&self, change_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.history(change_id).await
    }

    async fn import_marker(&self, source: &str) -> Result<Option<ImportMarker>, AuditError> {
        self.inner.import_marker(source).await
    }

    async fn write_import_marker(&self, marker: &ImportMarker) -> Result<(), AuditError> {
        self.inner.write_import_marker(marker).await
    }
}

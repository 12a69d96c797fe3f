//! In-memory key/value target system.
//!
//! Operation references are `;`- or newline-separated commands:
//! `set <key> <value>`, `delete <key>` and `fail [message]`. Used by the
//! engine tests and handy for dry runs of a definition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AdapterError, AuditWrite, TargetSystem};
use crate::domain::ChangeUnit;

#[derive(Debug, Clone, PartialEq, Eq)]
enum KvOp {
    Set(String, String),
    Delete(String),
    Fail(String),
}

fn parse_ops(operation: &str) -> Result<Vec<KvOp>, AdapterError> {
    let invalid = |message: &str| AdapterError::InvalidOperation {
        operation: operation.to_string(),
        message: message.to_string(),
    };

    operation
        .split(|c: char| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .map(|cmd| {
            let mut parts = cmd.splitn(3, char::is_whitespace);
            match (parts.next(), parts.next(), parts.next()) {
                (Some("set"), Some(key), Some(value)) => {
                    Ok(KvOp::Set(key.to_string(), value.trim().to_string()))
                }
                (Some("set"), _, _) => Err(invalid("set needs a key and a value")),
                (Some("delete"), Some(key), None) => Ok(KvOp::Delete(key.to_string())),
                (Some("delete"), _, _) => Err(invalid("delete needs exactly one key")),
                (Some("fail"), first, rest) => {
                    let message = [first, rest]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join(" ");
                    Ok(KvOp::Fail(if message.is_empty() {
                        "requested failure".to_string()
                    } else {
                        message
                    }))
                }
                _ => Err(invalid("unknown command")),
            }
        })
        .collect()
}

/// Apply ops in order; earlier ops stay applied when a later one fails
fn apply_ops(data: &mut BTreeMap<String, String>, ops: Vec<KvOp>) -> Result<(), AdapterError> {
    for op in ops {
        match op {
            KvOp::Set(key, value) => {
                data.insert(key, value);
            }
            KvOp::Delete(key) => {
                data.remove(&key);
            }
            KvOp::Fail(message) => return Err(AdapterError::Operation(message)),
        }
    }
    Ok(())
}

/// Key/value store held in memory
pub struct InMemoryTargetSystem {
    id: String,
    transactional: bool,
    latency: Option<Duration>,
    data: Mutex<BTreeMap<String, String>>,
    executions: AtomicUsize,
    rollbacks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_next_commit: AtomicBool,
}

struct InFlight<'a>(&'a InMemoryTargetSystem);

impl<'a> InFlight<'a> {
    fn enter(system: &'a InMemoryTargetSystem) -> Self {
        let now = system.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        system.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(system)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryTargetSystem {
    /// Non-transactional store
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transactional: false,
            latency: None,
            data: Mutex::new(BTreeMap::new()),
            executions: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Store that stages writes until the audit entry is written
    pub fn transactional(id: impl Into<String>) -> Self {
        Self {
            transactional: true,
            ..Self::new(id)
        }
    }

    /// Delay every execution (to observe concurrency)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next transactional commit fail after its audit write
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.get(key).cloned()
    }

    /// Copy of the current contents
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.lock().await.clone()
    }

    /// Number of execute calls (including transactional ones)
    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Highest number of executions observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TargetSystem for InMemoryTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn execute(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let ops = parse_ops(&change.execute)?;
        let _guard = InFlight::enter(self);
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        debug!(target_system = %self.id, change_id = %change.id, "Applying change");
        apply_ops(&mut *self.data.lock().await, ops)
    }

    async fn rollback(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let operation = change
            .rollback
            .as_deref()
            .ok_or_else(|| AdapterError::NoRollback(change.id.clone()))?;
        let ops = parse_ops(operation)?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);

        apply_ops(&mut *self.data.lock().await, ops)
    }

    async fn run_in_transaction<'a>(
        &'a self,
        change: &'a ChangeUnit,
        audit_write: AuditWrite<'a>,
    ) -> Result<(), AdapterError> {
        if !self.transactional {
            return Err(AdapterError::NotTransactional(self.id.clone()));
        }

        let ops = parse_ops(&change.execute)?;
        let _guard = InFlight::enter(self);
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut data = self.data.lock().await;
        let mut staged = data.clone();
        apply_ops(&mut staged, ops)?;

        audit_write.await.map_err(AdapterError::AuditWrite)?;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::CommitFailed("commit rejected".to_string()));
        }
        *data = staged;
        Ok(())
    }
}

//! Target system adapters.
//!
//! A target system is the external backend a change unit is applied to.
//! Adapters expose execute/rollback and declare whether they can run a
//! change and its audit write inside one transaction.

pub mod memory;
pub mod shell;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::audit::AuditError;
use crate::domain::ChangeUnit;

pub use memory::InMemoryTargetSystem;
pub use shell::ShellTargetSystem;
pub use sqlite::SqliteTargetSystem;

/// Audit write handed to a transactional adapter; it must be awaited
/// inside the backend transaction, after the change has been applied.
pub type AuditWrite<'a> = Pin<Box<dyn Future<Output = Result<(), AuditError>> + Send + 'a>>;

/// Errors raised by target systems
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Invalid operation '{operation}': {message}")]
    InvalidOperation { operation: String, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Target system '{0}' does not support transactions")]
    NotTransactional(String),

    #[error("Change '{0}' declares no rollback")]
    NoRollback(String),

    #[error("Audit write inside transaction failed: {0}")]
    AuditWrite(AuditError),

    /// The audit entry was written but the backend transaction did not commit
    #[error("Commit failed after the audit entry was written: {0}")]
    CommitFailed(String),

    #[error("Target database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Target I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a registered adapter can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Registry id
    pub id: String,

    /// Whether change and audit write can share a transaction
    pub transactional: bool,
}

/// Backend a change unit is applied to
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Registry id referenced by change units
    fn id(&self) -> &str;

    /// Whether `run_in_transaction` is supported
    fn is_transactional(&self) -> bool;

    fn capability(&self) -> Capability {
        Capability {
            id: self.id().to_string(),
            transactional: self.is_transactional(),
        }
    }

    /// Apply the change
    async fn execute(&self, change: &ChangeUnit) -> Result<(), AdapterError>;

    /// Undo the change using its declared rollback operation
    async fn rollback(&self, change: &ChangeUnit) -> Result<(), AdapterError>;

    /// Apply the change and await `audit_write` in one transaction; commit
    /// only if both succeed. A commit that fails after `audit_write`
    /// completed is reported as `CommitFailed`.
    async fn run_in_transaction<'a>(
        &'a self,
        change: &'a ChangeUnit,
        audit_write: AuditWrite<'a>,
    ) -> Result<(), AdapterError> {
        let _ = (change, audit_write);
        Err(AdapterError::NotTransactional(self.id().to_string()))
    }

    /// Check the backend is reachable
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Target systems available to the executor, keyed by id
#[derive(Clone, Default)]
pub struct TargetSystemRegistry {
    systems: HashMap<String, Arc<dyn TargetSystem>>,
}

impl TargetSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id
    pub fn register(&mut self, system: Arc<dyn TargetSystem>) -> &mut Self {
        self.systems.insert(system.id().to_string(), system);
        self
    }

    /// Builder form of `register`
    pub fn with(mut self, system: Arc<dyn TargetSystem>) -> Self {
        self.register(system);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TargetSystem>> {
        self.systems.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.systems.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.systems.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.systems.values().map(|s| s.capability()).collect();
        caps.sort_by(|a, b| a.id.cmp(&b.id));
        caps
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

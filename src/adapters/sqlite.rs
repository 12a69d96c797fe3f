//! SQLite target system.
//!
//! Operation references are SQL batches. Transactional runs wrap the batch
//! and the audit write in `BEGIN IMMEDIATE` / `COMMIT`, rolling back if
//! either fails.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AdapterError, AuditWrite, TargetSystem};
use crate::domain::ChangeUnit;

/// Target system backed by a SQLite database
pub struct SqliteTargetSystem {
    id: String,
    conn: Mutex<Connection>,
}

impl SqliteTargetSystem {
    /// Open (or create) the database at `path`
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            id: id.into(),
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    /// In-memory database (for testing)
    pub fn in_memory(id: impl Into<String>) -> Result<Self, AdapterError> {
        Ok(Self {
            id: id.into(),
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Run a query returning a single integer
    pub async fn query_scalar(&self, sql: &str) -> Result<i64, AdapterError> {
        let conn = self.conn.lock().await;
        let value = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(value)
    }
}

fn roll_back(conn: &Connection, change_id: &str) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(change_id, error = %e, "Failed to roll back target transaction");
    }
}

#[async_trait]
impl TargetSystem for SqliteTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn execute(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(&change.execute)?;
        Ok(())
    }

    async fn rollback(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let sql = change
            .rollback
            .as_deref()
            .ok_or_else(|| AdapterError::NoRollback(change.id.clone()))?;
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }

    async fn run_in_transaction<'a>(
        &'a self,
        change: &'a ChangeUnit,
        audit_write: AuditWrite<'a>,
    ) -> Result<(), AdapterError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        if let Err(e) = conn.execute_batch(&change.execute) {
            roll_back(&conn, &change.id);
            return Err(e.into());
        }

        if let Err(e) = audit_write.await {
            roll_back(&conn, &change.id);
            return Err(AdapterError::AuditWrite(e));
        }

        if let Err(e) = conn.execute_batch("COMMIT") {
            roll_back(&conn, &change.id);
            return Err(AdapterError::CommitFailed(e.to_string()));
        }

        debug!(change_id = %change.id, target_system = %self.id, "Transaction committed");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        self.query_scalar("SELECT 1").await.map(|_| ())
    }
}

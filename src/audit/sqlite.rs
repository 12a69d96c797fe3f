//! SQLite-backed audit store.
//!
//! One row per audit entry; `sequence` is the AUTOINCREMENT row id so
//! insertion order survives restarts. Timestamps are stored as epoch
//! microseconds.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{AuditError, AuditStore};
use crate::domain::{AuditEntry, AuditState, ImportMarker};

const ENTRY_COLUMNS: &str = "sequence, changeId, stage, state, author, checksum, timestamp, \
     durationMillis, error, executionId, targetSystem";

/// How long a write waits on another connection's lock before failing busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Audit store persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    /// Open (or create) a store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, AuditError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AuditError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        lock_conn(&self.conn)
    }

    /// Run blocking database work off the async runtime
    async fn with_conn<R, F>(&self, op: F) -> Result<R, AuditError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, AuditError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn)?;
            op(&conn)
        })
        .await
        .map_err(|e| AuditError::Unavailable(format!("audit task failed: {}", e)))?
    }

    fn init_schema(&self) -> Result<(), AuditError> {
        let conn = self.lock()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                changeId TEXT NOT NULL,
                stage TEXT NOT NULL,
                state TEXT NOT NULL,
                author TEXT NOT NULL,
                checksum TEXT,
                timestamp INTEGER NOT NULL,
                durationMillis INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                executionId TEXT NOT NULL,
                targetSystem TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_change
                ON audit_entries(changeId, timestamp, sequence);
            CREATE TABLE IF NOT EXISTS audit_import_markers (
                source TEXT PRIMARY KEY,
                importedAt INTEGER NOT NULL,
                importedCount INTEGER NOT NULL,
                skippedCount INTEGER NOT NULL
            );",
        )?;

        Ok(())
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, AuditError> {
    conn.lock()
        .map_err(|_| AuditError::Unavailable("audit connection poisoned".to_string()))
}

fn micros_to_datetime(micros: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", micros).into(),
        )
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let state_text: String = row.get(3)?;
    let state = state_text.parse::<AuditState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(AuditEntry {
        sequence: row.get::<_, i64>(0)? as u64,
        change_id: row.get(1)?,
        stage: row.get(2)?,
        state,
        author: row.get(4)?,
        checksum: row.get(5)?,
        timestamp: micros_to_datetime(row.get(6)?, 6)?,
        duration_millis: row.get::<_, i64>(7)? as u64,
        error: row.get(8)?,
        execution_id: row.get(9)?,
        target_system: row.get(10)?,
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, entry: &AuditEntry) -> Result<u64, AuditError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_entries
                    (changeId, stage, state, author, checksum, timestamp,
                     durationMillis, error, executionId, targetSystem)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.change_id,
                    entry.stage,
                    entry.state.as_str(),
                    entry.author,
                    entry.checksum,
                    entry.timestamp.timestamp_micros(),
                    entry.duration_millis as i64,
                    entry.error,
                    entry.execution_id,
                    entry.target_system,
                ],
            )?;

            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn latest_entry(&self, change_id: &str) -> Result<Option<AuditEntry>, AuditError> {
        let change_id = change_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM audit_entries WHERE changeId = ?1
                 ORDER BY timestamp DESC, sequence DESC LIMIT 1",
                ENTRY_COLUMNS
            );

            let entry = conn
                .query_row(&sql, params![change_id], row_to_entry)
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn all_latest_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM audit_entries a
                 WHERE a.sequence = (
                     SELECT b.sequence FROM audit_entries b
                     WHERE b.changeId = a.changeId
                     ORDER BY b.timestamp DESC, b.sequence DESC LIMIT 1
                 )
                 ORDER BY a.sequence",
                ENTRY_COLUMNS
            );

            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map([], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn history(&self, change_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let change_id = change_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM audit_entries WHERE changeId = ?1 ORDER BY sequence",
                ENTRY_COLUMNS
            );

            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params![change_id], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn import_marker(&self, source: &str) -> Result<Option<ImportMarker>, AuditError> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            let marker = conn
                .query_row(
                    "SELECT source, importedAt, importedCount, skippedCount
                     FROM audit_import_markers WHERE source = ?1",
                    params![source],
                    |row| {
                        Ok(ImportMarker {
                            source: row.get(0)?,
                            imported_at: micros_to_datetime(row.get(1)?, 1)?,
                            imported_count: row.get::<_, i64>(2)? as usize,
                            skipped_count: row.get::<_, i64>(3)? as usize,
                        })
                    },
                )
                .optional()?;
            Ok(marker)
        })
        .await
    }

    async fn write_import_marker(&self, marker: &ImportMarker) -> Result<(), AuditError> {
        let marker = marker.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO audit_import_markers
                    (source, importedAt, importedCount, skippedCount)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    marker.source,
                    marker.imported_at.timestamp_micros(),
                    marker.imported_count as i64,
                    marker.skipped_count as i64,
                ],
            )?;

            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_latest_entry_and_history() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let now = Utc::now();

        let pending = AuditEntry::new("c1", "s", AuditState::Pending, "dev", None, "r")
            .with_timestamp(now);
        let executed =
            AuditEntry::new("c1", "s", AuditState::Executed, "dev", Some("abc".into()), "r")
                .with_timestamp(now)
                .with_duration(42);

        assert_eq!(store.append(&pending).await.unwrap(), 1);
        assert_eq!(store.append(&executed).await.unwrap(), 2);

        let latest = store.latest_entry("c1").await.unwrap().unwrap();
        assert_eq!(latest.state, AuditState::Executed);
        assert_eq!(latest.checksum.as_deref(), Some("abc"));
        assert_eq!(latest.duration_millis, 42);
        assert_eq!(store.history("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_all_latest_prefers_timestamp_over_insertion() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let now = Utc::now();

        let recent = AuditEntry::new("c1", "s", AuditState::Failed, "dev", None, "r")
            .with_timestamp(now);
        let imported = AuditEntry::new("c1", "s", AuditState::Executed, "dev", None, "r")
            .with_timestamp(now - Duration::days(30));
        let other = AuditEntry::new("c2", "s", AuditState::Executed, "dev", None, "r");

        store.append(&recent).await.unwrap();
        store.append(&imported).await.unwrap();
        store.append(&other).await.unwrap();

        let latest = store.all_latest_entries().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].change_id, "c1");
        assert_eq!(latest[0].state, AuditState::Failed);
        assert_eq!(latest[1].change_id, "c2");
    }

    #[tokio::test]
    async fn test_import_marker_round_trip() {
        let store = SqliteAuditStore::in_memory().unwrap();
        assert!(store.import_marker("mongock").await.unwrap().is_none());

        let marker = ImportMarker {
            source: "mongock".to_string(),
            imported_at: Utc::now(),
            imported_count: 3,
            skipped_count: 1,
        };
        store.write_import_marker(&marker).await.unwrap();

        let found = store.import_marker("mongock").await.unwrap().unwrap();
        assert_eq!(found.imported_count, 3);
        assert_eq!(found.skipped_count, 1);
    }
}

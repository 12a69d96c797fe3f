//! Append-only audit store with file-based persistence.
//!
//! Entries are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy inspection. Import markers live in a sibling
//! `<name>.imports.jsonl` file.
//!
//! Every append holds an exclusive advisory lock (fs2) on the file and
//! derives the next sequence from the file itself, so separate handles and
//! processes sharing one file never hand out the same sequence. Readers take
//! a shared lock.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::debug;

use super::{latest_by_change, latest_of, AuditError, AuditStore};
use crate::domain::{AuditEntry, ImportMarker};

/// Sequence last seen by this handle and the file length it was seen at
#[derive(Debug, Clone, Copy, Default)]
struct SequenceCursor {
    file_len: u64,
    last_sequence: u64,
}

/// File-based audit store using JSONL format
pub struct JsonlAuditStore {
    /// Path to the entries file
    entries_path: PathBuf,

    /// Path to the import markers file
    markers_path: PathBuf,

    /// Valid only while the file length is unchanged
    cursor: Arc<Mutex<Option<SequenceCursor>>>,
}

impl JsonlAuditStore {
    /// Create or open a store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let entries_path = path.into();

        if let Some(parent) = entries_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let markers_path = entries_path.with_extension("imports.jsonl");

        Ok(Self {
            entries_path,
            markers_path,
            cursor: Arc::new(Mutex::new(None)),
        })
    }

    /// Path to the entries file
    pub fn entries_path(&self) -> &Path {
        &self.entries_path
    }

    /// Replay all entries in insertion order
    pub async fn replay(&self) -> Result<Vec<AuditEntry>, AuditError> {
        read_records(self.entries_path.clone()).await
    }

    async fn replay_markers(&self) -> Result<Vec<ImportMarker>, AuditError> {
        read_records(self.markers_path.clone()).await
    }
}

async fn blocking<R, F>(op: F) -> Result<R, AuditError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, AuditError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| AuditError::Unavailable(format!("audit task failed: {}", e)))?
}

async fn read_records<T>(path: PathBuf) -> Result<Vec<T>, AuditError>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    blocking(move || {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        FileExt::lock_shared(&file)?;
        let records = parse_lines(&file, &path);
        FileExt::unlock(&file)?;
        records
    })
    .await
}

fn parse_lines<T>(file: &File, path: &Path) -> Result<Vec<T>, AuditError>
where
    T: serde::de::DeserializeOwned,
{
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(|e| AuditError::Corrupt(format!("{}: {}", path.display(), e)))?;
        records.push(record);
    }
    Ok(records)
}

fn open_for_append(path: &Path) -> Result<File, AuditError> {
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn write_line<T: serde::Serialize>(mut file: &File, record: &T) -> Result<(), AuditError> {
    let json = serde_json::to_string(record)?;
    file.write_all(format!("{}\n", json).as_bytes())?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

/// Append `entry` with the next sequence; the caller holds no lock
fn append_entry(
    path: &Path,
    cursor: &Mutex<Option<SequenceCursor>>,
    mut entry: AuditEntry,
) -> Result<AuditEntry, AuditError> {
    let file = open_for_append(path)?;
    let result = append_locked(&file, path, cursor, &mut entry);
    FileExt::unlock(&file)?;
    result.map(|_| entry)
}

fn append_locked(
    file: &File,
    path: &Path,
    cursor: &Mutex<Option<SequenceCursor>>,
    entry: &mut AuditEntry,
) -> Result<(), AuditError> {
    let file_len = file.metadata()?.len();
    let cached = match cursor.lock() {
        Ok(slot) => *slot,
        Err(poisoned) => *poisoned.into_inner(),
    };

    let last_sequence = match cached {
        Some(c) if c.file_len == file_len => c.last_sequence,
        _ => parse_lines::<AuditEntry>(file, path)?
            .iter()
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0),
    };

    entry.sequence = last_sequence + 1;
    write_line(file, entry)?;

    let next = SequenceCursor {
        file_len: file.metadata()?.len(),
        last_sequence: entry.sequence,
    };
    match cursor.lock() {
        Ok(mut slot) => *slot = Some(next),
        Err(poisoned) => *poisoned.into_inner() = Some(next),
    }
    Ok(())
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, entry: &AuditEntry) -> Result<u64, AuditError> {
        let path = self.entries_path.clone();
        let cursor = Arc::clone(&self.cursor);
        let entry = entry.clone();

        let written = blocking(move || append_entry(&path, &cursor, entry)).await?;

        debug!(
            change_id = %written.change_id,
            state = %written.state,
            sequence = written.sequence,
            "Audit entry appended"
        );
        Ok(written.sequence)
    }

    async fn latest_entry(&self, change_id: &str) -> Result<Option<AuditEntry>, AuditError> {
        let entries = self.replay().await?;
        Ok(latest_of(entries.iter().filter(|e| e.change_id == change_id)).cloned())
    }

    async fn all_latest_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(latest_by_change(self.replay().await?))
    }

    async fn history(&self, change_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.replay().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.change_id == change_id)
            .collect())
    }

    async fn import_marker(&self, source: &str) -> Result<Option<ImportMarker>, AuditError> {
        let markers = self.replay_markers().await?;
        Ok(markers.into_iter().rev().find(|m| m.source == source))
    }

    async fn write_import_marker(&self, marker: &ImportMarker) -> Result<(), AuditError> {
        let path = self.markers_path.clone();
        let marker = marker.clone();
        blocking(move || {
            let file = open_for_append(&path)?;
            let result = write_line(&file, &marker);
            FileExt::unlock(&file)?;
            result
        })
        .await
    }
}

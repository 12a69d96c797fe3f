//! File-backed lock store.
//!
//! Lease state is a JSON document guarded by an OS advisory lock (fs2), so
//! processes on the same host, or sharing a filesystem that honours
//! `flock`, coordinate through it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;

use super::{Lease, LockError, LockStore, LockTable};

/// Lock store persisted in a single lease file
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn transact<R, F>(&self, op: F) -> Result<R, LockError>
    where
        R: Send + 'static,
        F: FnOnce(&mut LockTable) -> Result<R, LockError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || with_table(&path, op))
            .await
            .map_err(|e| LockError::Backend(format!("lock task failed: {}", e)))?
    }
}

/// Load the table under an exclusive file lock, apply `op`, write it back
fn with_table<R>(
    path: &Path,
    op: impl FnOnce(&mut LockTable) -> Result<R, LockError>,
) -> Result<R, LockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.lock_exclusive()?;

    let result = apply(&mut file, op);

    FileExt::unlock(&file)?;
    result
}

fn apply<R>(
    file: &mut File,
    op: impl FnOnce(&mut LockTable) -> Result<R, LockError>,
) -> Result<R, LockError> {
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    let mut table: LockTable = if content.trim().is_empty() {
        LockTable::default()
    } else {
        serde_json::from_str(&content)?
    };

    let result = op(&mut table)?;

    let json = serde_json::to_string_pretty(&table)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.sync_data()?;
    Ok(result)
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Lease, LockError> {
        let key = key.to_string();
        let owner = owner.to_string();
        self.transact(move |table| table.try_acquire(&key, &owner, lease, Utc::now()))
            .await
    }

    async fn renew(&self, lease: &Lease, extend: Duration) -> Result<Lease, LockError> {
        let lease = lease.clone();
        self.transact(move |table| table.renew(&lease, extend, Utc::now()))
            .await
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let lease = lease.clone();
        self.transact(move |table| {
            table.release(&lease);
            Ok(())
        })
        .await
    }

    async fn current(&self, key: &str) -> Result<Option<Lease>, LockError> {
        let key = key.to_string();
        self.transact(move |table| Ok(table.current(&key, Utc::now())))
            .await
    }
}

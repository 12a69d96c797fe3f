//! In-process lock store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{Lease, LockError, LockStore, LockTable};

/// Lock store shared by tasks of one process
#[derive(Default)]
pub struct InMemoryLockStore {
    table: Mutex<LockTable>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Lease, LockError> {
        self.table
            .lock()
            .await
            .try_acquire(key, owner, lease, Utc::now())
    }

    async fn renew(&self, lease: &Lease, extend: Duration) -> Result<Lease, LockError> {
        self.table.lock().await.renew(lease, extend, Utc::now())
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        self.table.lock().await.release(lease);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<Lease>, LockError> {
        Ok(self.table.lock().await.current(key, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_frees_key() {
        let store = InMemoryLockStore::new();
        let lease = store
            .try_acquire("k", "a", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.current("k").await.unwrap(), Some(lease.clone()));

        store.release(&lease).await.unwrap();
        assert!(store.current("k").await.unwrap().is_none());
    }
}

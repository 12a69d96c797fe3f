//! Lease-based distributed lock with fencing tokens.
//!
//! A `LockStore` keeps at most one live lease per key. Every successful
//! acquisition bumps the key's fencing token, so a holder whose lease was
//! taken over can detect it by comparing tokens. `DistributedLock` adds
//! polling acquisition and hands out a `LeaseGuard` that keeps the lease
//! alive with a heartbeat task.

pub mod file;
pub mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use file::FileLockStore;
pub use memory::InMemoryLockStore;

/// Default key guarding pipeline runs
pub const DEFAULT_LOCK_KEY: &str = "changeflow-pipeline";

/// Errors raised by lock stores and guards
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{key}' is held by {owner} until {expires_at}")]
    Busy {
        key: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lease on '{key}' (token {token}) expired or was taken over")]
    LeaseExpired { key: String, token: u64 },

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("Lock file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Proof of lock ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lock key
    pub key: String,

    /// Instance holding the lease
    pub owner: String,

    pub acquired_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Fencing token, strictly increasing per key
    pub token: u64,
}

impl Lease {
    /// Whether the lease has run out at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Backend contract for lease storage
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free or its lease has expired
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Lease, LockError>;

    /// Extend a live lease; fails with `LeaseExpired` if it is no longer current
    async fn renew(&self, lease: &Lease, extend: Duration) -> Result<Lease, LockError>;

    /// Give the lock up; releasing a superseded lease is a no-op
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;

    /// Current live lease for a key
    async fn current(&self, key: &str) -> Result<Option<Lease>, LockError>;
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, LockError> {
    chrono::Duration::from_std(duration).map_err(|e| LockError::Backend(e.to_string()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LockSlot {
    lease: Option<Lease>,
    last_token: u64,
}

/// Lease bookkeeping shared by the lock store implementations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockTable {
    slots: HashMap<String, LockSlot>,
}

impl LockTable {
    pub fn try_acquire(
        &mut self,
        key: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, LockError> {
        let lease_duration = to_chrono(lease)?;
        let slot = self.slots.entry(key.to_string()).or_default();

        // A live lease is busy even for its own owner; only expiry frees it
        if let Some(held) = &slot.lease {
            if !held.is_expired_at(now) {
                return Err(LockError::Busy {
                    key: key.to_string(),
                    owner: held.owner.clone(),
                    expires_at: held.expires_at,
                });
            }
        }

        slot.last_token += 1;
        let granted = Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + lease_duration,
            token: slot.last_token,
        };
        slot.lease = Some(granted.clone());
        Ok(granted)
    }

    pub fn renew(
        &mut self,
        lease: &Lease,
        extend: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, LockError> {
        let extend = to_chrono(extend)?;
        let expired = || LockError::LeaseExpired {
            key: lease.key.clone(),
            token: lease.token,
        };

        let held = self
            .slots
            .get_mut(&lease.key)
            .and_then(|slot| slot.lease.as_mut())
            .ok_or_else(expired)?;

        if held.token != lease.token || held.is_expired_at(now) {
            return Err(expired());
        }

        held.expires_at = now + extend;
        Ok(held.clone())
    }

    pub fn release(&mut self, lease: &Lease) {
        if let Some(slot) = self.slots.get_mut(&lease.key) {
            if slot.lease.as_ref().map(|l| l.token) == Some(lease.token) {
                slot.lease = None;
            }
        }
    }

    pub fn current(&self, key: &str, now: DateTime<Utc>) -> Option<Lease> {
        self.slots
            .get(key)
            .and_then(|slot| slot.lease.clone())
            .filter(|lease| !lease.is_expired_at(now))
    }
}

/// Lock timing configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Key guarding the pipeline
    pub key: String,

    /// Lease length granted on acquisition and renewal
    pub lease_duration: Duration,

    /// How long `acquire` waits for a busy lock (zero = fail fast)
    pub acquire_timeout: Duration,

    /// Pause between acquisition attempts
    pub retry_interval: Duration,

    /// Heartbeat period
    pub renew_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_LOCK_KEY.to_string(),
            lease_duration: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(180),
            retry_interval: Duration::from_secs(1),
            renew_interval: Duration::from_secs(20),
        }
    }
}

/// Polling front-end over a `LockStore`
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Acquire using the configured timeout
    pub async fn acquire(&self, owner: &str) -> Result<LeaseGuard, LockError> {
        self.acquire_with_timeout(owner, self.config.acquire_timeout)
            .await
    }

    /// Poll the store until the lock is granted or `timeout` elapses
    pub async fn acquire_with_timeout(
        &self,
        owner: &str,
        timeout: Duration,
    ) -> Result<LeaseGuard, LockError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .store
                .try_acquire(&self.config.key, owner, self.config.lease_duration)
                .await
            {
                Ok(lease) => {
                    info!(key = %lease.key, owner, token = lease.token, "Lock acquired");
                    return Ok(LeaseGuard::start(
                        Arc::clone(&self.store),
                        lease,
                        &self.config,
                    ));
                }
                Err(LockError::Busy {
                    key,
                    owner: holder,
                    expires_at,
                }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Busy {
                            key,
                            owner: holder,
                            expires_at,
                        });
                    }
                    debug!(key = %key, holder = %holder, "Lock busy, waiting");
                    let wait = self.config.retry_interval.min(deadline - now);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct GuardInner {
    store: Arc<dyn LockStore>,
    lease: Mutex<Lease>,
    lease_duration: Duration,
    lost: AtomicBool,
    released: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl GuardInner {
    fn snapshot(&self) -> Lease {
        match self.lease.lock() {
            Ok(lease) => lease.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store_lease(&self, lease: Lease) {
        match self.lease.lock() {
            Ok(mut current) => *current = lease,
            Err(poisoned) => *poisoned.into_inner() = lease,
        }
    }

    fn stop_heartbeat(&self) {
        let handle = match self.heartbeat.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn renew(&self) -> Result<Lease, LockError> {
        let lease = self.snapshot();
        match self.store.renew(&lease, self.lease_duration).await {
            Ok(renewed) => {
                self.store_lease(renewed.clone());
                Ok(renewed)
            }
            Err(e) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

/// Handle on a held lease; clones share the same lease and heartbeat
#[derive(Clone)]
pub struct LeaseGuard {
    inner: Arc<GuardInner>,
}

impl LeaseGuard {
    fn start(store: Arc<dyn LockStore>, lease: Lease, config: &LockConfig) -> Self {
        let inner = Arc::new(GuardInner {
            store,
            lease: Mutex::new(lease),
            lease_duration: config.lease_duration,
            lost: AtomicBool::new(false),
            released: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        });

        let handle = tokio::spawn(heartbeat(Arc::downgrade(&inner), config.renew_interval));
        if let Ok(mut slot) = inner.heartbeat.lock() {
            *slot = Some(handle);
        }

        Self { inner }
    }

    /// Copy of the lease as last granted or renewed
    pub fn lease(&self) -> Lease {
        self.inner.snapshot()
    }

    pub fn token(&self) -> u64 {
        self.lease().token
    }

    /// Whether a renewal has failed
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Checkpoint: fail if the lease expired, a renewal failed, or a newer
    /// token holds the key
    pub async fn ensure_current(&self) -> Result<(), LockError> {
        let lease = self.lease();
        let expired = || LockError::LeaseExpired {
            key: lease.key.clone(),
            token: lease.token,
        };

        if self.is_lost() || self.inner.released.load(Ordering::SeqCst) {
            return Err(expired());
        }
        if lease.is_expired_at(Utc::now()) {
            self.inner.lost.store(true, Ordering::SeqCst);
            return Err(expired());
        }

        match self.inner.store.current(&lease.key).await? {
            Some(current) if current.token == lease.token => Ok(()),
            _ => {
                self.inner.lost.store(true, Ordering::SeqCst);
                Err(expired())
            }
        }
    }

    /// Extend the lease now
    pub async fn renew(&self) -> Result<Lease, LockError> {
        self.inner.renew().await
    }

    /// Stop the heartbeat and release the lease in the store
    pub async fn release(&self) -> Result<(), LockError> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_heartbeat();

        let lease = self.lease();
        self.inner.store.release(&lease).await?;
        info!(key = %lease.key, token = lease.token, "Lock released");
        Ok(())
    }
}

async fn heartbeat(inner: Weak<GuardInner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.released.load(Ordering::SeqCst) {
            break;
        }

        match inner.renew().await {
            Ok(lease) => debug!(key = %lease.key, token = lease.token, "Lease renewed"),
            Err(e) => {
                warn!(error = %e, "Lease renewal failed, lock considered lost");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_grants_increasing_tokens() {
        let mut table = LockTable::default();
        let now = Utc::now();
        let lease = Duration::from_secs(10);

        let first = table.try_acquire("k", "a", lease, now).unwrap();
        assert_eq!(first.token, 1);

        let busy = table.try_acquire("k", "b", lease, now);
        assert!(matches!(busy, Err(LockError::Busy { ref owner, .. }) if owner == "a"));

        table.release(&first);
        let second = table.try_acquire("k", "b", lease, now).unwrap();
        assert_eq!(second.token, 2);
    }

    #[test]
    fn test_table_takes_over_expired_lease() {
        let mut table = LockTable::default();
        let now = Utc::now();
        let first = table
            .try_acquire("k", "a", Duration::from_secs(1), now)
            .unwrap();

        let later = now + chrono::Duration::seconds(5);
        let second = table
            .try_acquire("k", "b", Duration::from_secs(1), later)
            .unwrap();
        assert_eq!(second.token, first.token + 1);

        let renew = table.renew(&first, Duration::from_secs(1), later);
        assert!(matches!(renew, Err(LockError::LeaseExpired { token: 1, .. })));

        // A stale release must not free the new holder's lease
        table.release(&first);
        assert_eq!(table.current("k", later).unwrap().owner, "b");
    }

    #[test]
    fn test_table_refuses_live_lease_to_same_owner() {
        let mut table = LockTable::default();
        let now = Utc::now();
        let lease = Duration::from_secs(10);

        let first = table.try_acquire("k", "a", lease, now).unwrap();
        let again = table.try_acquire("k", "a", lease, now);
        assert!(matches!(again, Err(LockError::Busy { ref owner, .. }) if owner == "a"));
        assert_eq!(table.current("k", now).unwrap().token, first.token);

        // Once expired, the same owner may take it again with a new token
        let later = now + chrono::Duration::seconds(11);
        let second = table.try_acquire("k", "a", lease, later).unwrap();
        assert_eq!(second.token, first.token + 1);
    }

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.acquire_timeout, Duration::from_secs(180));
        assert!(config.renew_interval < config.lease_duration);
    }
}

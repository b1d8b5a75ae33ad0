//! In-process lock manager.
//!
//! One async mutex per [`LockKey`], created on demand and pruned once nobody
//! holds or waits for it. Suitable for a single process; multi-process
//! deployments use the Postgres advisory locks from `tessera-db`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::tenancy::backend::{LockGuard, LockManager};
use crate::tenancy::error::TenancyError;
use crate::tenancy::types::LockKey;

type LockTable = DashMap<LockKey, Arc<Mutex<()>>>;

/// Keyed async mutexes.
#[derive(Debug, Clone, Default)]
pub struct LocalLockManager {
    locks: Arc<LockTable>,
}

impl LocalLockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}

/// Guard for a [`LocalLockManager`] lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LocalLockGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl LocalLockGuard {
    /// Key this guard holds.
    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table itself still references an idle mutex.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
impl LockGuard for LocalLockGuard {
    async fn release(self) -> Result<(), TenancyError> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    type Guard = LocalLockGuard;

    async fn acquire(&self, key: LockKey, wait: Duration) -> Result<Self::Guard, TenancyError> {
        let mutex = self.locks.entry(key).or_default().clone();

        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(LocalLockGuard {
                key,
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => {
                self.locks
                    .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
                Err(TenancyError::LockTimeout(key))
            }
        }
    }
}

//! Postgres advisory locks.
//!
//! Advisory locks belong to the session that took them, so every held lock
//! owns one connection. Those connections come from a small pool of their
//! own: waiting for or holding a lock never takes a connection away from
//! the work running under it.
//!
//! Same-key waiters inside one process queue on an in-process mutex first,
//! so at most one session per key polls `pg_try_advisory_lock`, and the
//! poller hands its connection back between attempts. Releasing unlocks and
//! returns the connection; a guard dropped without release detaches and
//! closes its connection, which ends the session and frees the lock
//! server-side.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use tessera_core::TenancyError;
use tessera_core::tenancy::{LocalLockGuard, LocalLockManager, LockGuard, LockKey, LockManager};
use tessera_shared::{DatabaseConfig, TenancyConfig};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::map_sqlx_err;

/// Key used for [`LockKey::Global`].
///
/// ASCII "tessera" left-aligned in the high bytes.
pub const GLOBAL_LOCK_KEY: i64 = 0x7465_7373_6572_6100;

/// Maps a lock key onto the 64-bit advisory lock space.
///
/// Tenant keys fold the two halves of the uuid together.
#[must_use]
pub fn advisory_key(key: LockKey) -> i64 {
    match key {
        LockKey::Tenant(id) => {
            let (high, low) = id.into_inner().as_u64_pair();
            i64::from_ne_bytes((high ^ low).to_ne_bytes())
        }
        LockKey::Global => GLOBAL_LOCK_KEY,
    }
}

/// Lock manager backed by `pg_try_advisory_lock`.
///
/// Clones share the in-process queue, so every lifecycle caller of one
/// process should use clones of a single manager.
#[derive(Debug, Clone)]
pub struct PgLockManager {
    pool: PgPool,
    local: LocalLockManager,
    poll_interval: Duration,
}

impl PgLockManager {
    /// Creates a lock manager over `pool`, polling every `poll_interval`
    /// while another process holds the lock.
    ///
    /// `pool` should be reserved for locks. Sharing the pool that runs
    /// the locked work lets waiters starve the holder.
    #[must_use]
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            local: LocalLockManager::new(),
            poll_interval,
        }
    }

    /// Opens the dedicated lock pool described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` or `Database` if the pool cannot connect.
    pub async fn connect(
        database: &DatabaseConfig,
        tenancy: &TenancyConfig,
    ) -> Result<Self, TenancyError> {
        let pool = PgPoolOptions::new()
            .max_connections(tenancy.lock_connections.max(1))
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(database.acquire_timeout_secs))
            .connect(&database.url)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self::new(pool, tenancy.lock_poll_interval()))
    }

    /// Tries the advisory lock once on a freshly checked out session.
    ///
    /// Returns the session if the lock was taken; otherwise the session
    /// goes back to the pool.
    async fn try_lock(
        &self,
        key: LockKey,
        deadline: Instant,
    ) -> Result<Option<PoolConnection<Postgres>>, TenancyError> {
        let mut conn = match tokio::time::timeout_at(deadline, self.pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => return Err(TenancyError::LockTimeout(key)),
            Ok(Err(e)) => return Err(map_sqlx_err(e)),
        };

        let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_key(key))
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

        Ok(locked.then_some(conn))
    }
}

/// A held advisory lock.
#[derive(Debug)]
pub struct PgLockGuard {
    key: LockKey,
    conn: Option<PoolConnection<Postgres>>,
    // Released after the session, so the next local waiter finds the key free.
    _local: LocalLockGuard,
}

impl PgLockGuard {
    /// Key this guard holds.
    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(lock = %self.key, "Advisory lock guard dropped without release, closing its session");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl LockGuard for PgLockGuard {
    async fn release(mut self) -> Result<(), TenancyError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(advisory_key(self.key))
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => {
                debug!(lock = %self.key, "Advisory lock released");
                Ok(())
            }
            Ok(false) => {
                drop(conn.detach());
                Err(TenancyError::Database(format!(
                    "advisory lock {} was not held by its session",
                    self.key
                )))
            }
            Err(e) => {
                drop(conn.detach());
                Err(map_sqlx_err(e))
            }
        }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    type Guard = PgLockGuard;

    async fn acquire(&self, key: LockKey, wait: Duration) -> Result<Self::Guard, TenancyError> {
        let deadline = Instant::now() + wait;
        let local = self.local.acquire(key, wait).await?;

        loop {
            if let Some(conn) = self.try_lock(key, deadline).await? {
                debug!(lock = %key, advisory = advisory_key(key), "Advisory lock acquired");
                return Ok(PgLockGuard {
                    key,
                    conn: Some(conn),
                    _local: local,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TenancyError::LockTimeout(key));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_shared::TenantId;
    use uuid::Uuid;

    #[test]
    fn test_tenant_key_folds_uuid_halves() {
        let id = TenantId::from_uuid(Uuid::from_u64_pair(0xF0F0, 0x0F0F));
        assert_eq!(advisory_key(LockKey::Tenant(id)), 0xFFFF);
    }

    #[test]
    fn test_tenant_key_is_stable() {
        let id = TenantId::new();
        assert_eq!(
            advisory_key(LockKey::Tenant(id)),
            advisory_key(LockKey::Tenant(id))
        );
    }

    fn unreachable_manager() -> PgLockManager {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://tessera@127.0.0.1:1/tessera")
            .unwrap();
        PgLockManager::new(pool, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_same_key_waiters_queue_without_a_session() {
        let locks = unreachable_manager();
        let key = LockKey::Tenant(TenantId::new());
        let _holder = locks.local.acquire(key, Duration::from_millis(10)).await.unwrap();

        let err = locks
            .acquire(key, Duration::from_millis(30))
            .await
            .unwrap_err();

        assert_eq!(err, TenancyError::LockTimeout(key));
        assert_eq!(locks.pool.size(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_the_local_queue() {
        let locks = unreachable_manager();
        let clone = locks.clone();
        let key = LockKey::Global;
        let _holder = locks.local.acquire(key, Duration::from_millis(10)).await.unwrap();

        assert_eq!(
            clone.acquire(key, Duration::from_millis(20)).await.unwrap_err(),
            TenancyError::LockTimeout(key)
        );
    }

    #[test]
    fn test_global_key_is_constant() {
        assert_eq!(advisory_key(LockKey::Global), GLOBAL_LOCK_KEY);
    }
}

//! Entry point used by domain code.

use std::time::Duration;

use futures::future::BoxFuture;
use tessera_shared::{TenancyConfig, TenantId};

use crate::tenancy::backend::TenancyBackend;
use crate::tenancy::coordinator::TenantLifecycleCoordinator;
use crate::tenancy::error::{TenancyError, Transient};
use crate::tenancy::executor::{ScopedError, ScopedExecutor};
use crate::tenancy::migration::MigrationSet;
use crate::tenancy::types::{LockPolicy, TenantRecord};

/// Timing knobs of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenancyOptions {
    /// Lock wait and retry policy for lifecycle operations.
    pub lock_policy: LockPolicy,
    /// Bound on waiting for a pooled connection.
    pub checkout_timeout: Duration,
}

impl Default for TenancyOptions {
    fn default() -> Self {
        Self::from(&TenancyConfig::default())
    }
}

impl From<&TenancyConfig> for TenancyOptions {
    fn from(config: &TenancyConfig) -> Self {
        Self {
            lock_policy: LockPolicy::new(config.lock_timeout())
                .with_retries(config.lock_retries, config.lock_backoff()),
            checkout_timeout: config.checkout_timeout(),
        }
    }
}

/// Provisioning plus scoped execution over one backend.
///
/// ```ignore
/// let tenancy = Tenancy::new(backend, tenant_set, TenancyOptions::default());
/// tenancy.provision(tenant_id).await?;
/// let count = tenancy
///     .with_tenant(tenant_id, |scope| Box::pin(async move { count_accounts(scope).await }))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Tenancy<B> {
    coordinator: TenantLifecycleCoordinator<B>,
    executor: ScopedExecutor<B>,
}

impl<B: TenancyBackend> Tenancy<B> {
    /// Wires the coordinator and the executor to `backend`.
    #[must_use]
    pub fn new(backend: B, tenant_set: MigrationSet, options: TenancyOptions) -> Self {
        Self {
            executor: ScopedExecutor::new(backend.clone(), options.checkout_timeout),
            coordinator: TenantLifecycleCoordinator::new(backend, tenant_set, options.lock_policy),
        }
    }

    /// Lifecycle operations beyond provision and deprovision.
    #[must_use]
    pub const fn coordinator(&self) -> &TenantLifecycleCoordinator<B> {
        &self.coordinator
    }

    /// The executor behind [`Self::with_tenant`].
    #[must_use]
    pub const fn executor(&self) -> &ScopedExecutor<B> {
        &self.executor
    }

    /// See [`TenantLifecycleCoordinator::provision`].
    ///
    /// # Errors
    ///
    /// Provisioning failures, after compensation.
    pub async fn provision(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError> {
        self.coordinator.provision(tenant_id).await
    }

    /// See [`TenantLifecycleCoordinator::provision_with`].
    ///
    /// # Errors
    ///
    /// `LockTimeout` once `policy` is exhausted, or provisioning failures.
    pub async fn provision_with(
        &self,
        tenant_id: TenantId,
        policy: LockPolicy,
    ) -> Result<TenantRecord, TenancyError> {
        self.coordinator.provision_with(tenant_id, policy).await
    }

    /// See [`TenantLifecycleCoordinator::deprovision`].
    ///
    /// # Errors
    ///
    /// Lock timeouts and drop failures.
    pub async fn deprovision(&self, tenant_id: TenantId) -> Result<(), TenancyError> {
        self.coordinator.deprovision(tenant_id).await
    }

    /// See [`TenantLifecycleCoordinator::deprovision_with`].
    ///
    /// # Errors
    ///
    /// Lock timeouts and drop failures.
    pub async fn deprovision_with(
        &self,
        tenant_id: TenantId,
        policy: LockPolicy,
    ) -> Result<(), TenancyError> {
        self.coordinator.deprovision_with(tenant_id, policy).await
    }

    /// See [`ScopedExecutor::run`].
    ///
    /// # Errors
    ///
    /// Resolution and binding failures, or the work's own error.
    pub async fn with_tenant<T, E, F>(&self, tenant_id: TenantId, work: F) -> Result<T, ScopedError<E>>
    where
        F: for<'s> FnOnce(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.executor.run(tenant_id, work).await
    }

    /// See [`ScopedExecutor::run_with_deadline`].
    ///
    /// # Errors
    ///
    /// Resolution and binding failures, or the work's own error.
    pub async fn with_tenant_deadline<T, E, F>(
        &self,
        tenant_id: TenantId,
        checkout: Duration,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        F: for<'s> FnOnce(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.executor.run_with_deadline(tenant_id, checkout, work).await
    }

    /// See [`ScopedExecutor::run_read_only`].
    ///
    /// # Errors
    ///
    /// Resolution and binding failures, or the work's own error.
    pub async fn with_tenant_read_only<T, E, F>(
        &self,
        tenant_id: TenantId,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        F: for<'s> Fn(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send + Sync,
        T: Send,
        E: Transient + Send,
    {
        self.executor.run_read_only(tenant_id, work).await
    }

    /// See [`ScopedExecutor::run_read_only_with_deadline`].
    ///
    /// # Errors
    ///
    /// Resolution and binding failures, or the work's own error.
    pub async fn with_tenant_read_only_deadline<T, E, F>(
        &self,
        tenant_id: TenantId,
        checkout: Duration,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        F: for<'s> Fn(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send + Sync,
        T: Send,
        E: Transient + Send,
    {
        self.executor
            .run_read_only_with_deadline(tenant_id, checkout, work)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    use crate::tenancy::backend::{LockManager, ScopeBinder};
    use crate::tenancy::memory::{MemoryBackend, MemoryOptions, MemoryScope};
    use crate::tenancy::migration::MigrationScript;
    use crate::tenancy::types::{Access, LockKey, SchemaName, TenantState};

    #[tokio::test]
    async fn test_per_call_deadlines_are_passed_through() {
        let backend = MemoryBackend::with_options(MemoryOptions {
            pool_size: 1,
            ..MemoryOptions::default()
        });
        let set = MigrationSet::new(vec![MigrationScript::new(1, "init", "CREATE TABLE t (id INT);")])
            .unwrap();
        let tenancy = Tenancy::new(backend.clone(), set, TenancyOptions::default());
        let tenant_id = TenantId::new();
        let short = LockPolicy::new(Duration::from_millis(20));

        let held = backend
            .acquire(LockKey::Tenant(tenant_id), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            tenancy.provision_with(tenant_id, short).await,
            Err(TenancyError::LockTimeout(LockKey::Tenant(tenant_id)))
        );
        drop(held);
        tenancy.provision(tenant_id).await.unwrap();

        let scope = backend
            .bind(&SchemaName::for_tenant(tenant_id), Access::ReadOnly)
            .await
            .unwrap();
        let err = tenancy
            .with_tenant_deadline(tenant_id, Duration::from_millis(20), |_: &MemoryScope| {
                async { Ok::<_, TenancyError>(()) }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err.flatten(), TenancyError::ScopeBindingFailed(_)));
        let err = tenancy
            .with_tenant_read_only_deadline(tenant_id, Duration::from_millis(20), |_: &MemoryScope| {
                async { Ok::<_, TenancyError>(()) }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err.flatten(), TenancyError::ScopeBindingFailed(_)));
        backend.rollback(scope).await.unwrap();

        let held = backend
            .acquire(LockKey::Tenant(tenant_id), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            tenancy.deprovision_with(tenant_id, short).await,
            Err(TenancyError::LockTimeout(LockKey::Tenant(tenant_id)))
        );
        drop(held);
        assert_eq!(
            tenancy.coordinator().tenant(tenant_id).await.unwrap().unwrap().state,
            TenantState::Active
        );
    }

    #[test]
    fn test_options_follow_config() {
        let config = TenancyConfig {
            lock_timeout_ms: 1_500,
            lock_retries: 2,
            lock_backoff_ms: 100,
            checkout_timeout_ms: 750,
            ..TenancyConfig::default()
        };
        let options = TenancyOptions::from(&config);
        assert_eq!(options.lock_policy.wait, Duration::from_millis(1_500));
        assert_eq!(options.lock_policy.retries, 2);
        assert_eq!(options.lock_policy.backoff, Duration::from_millis(100));
        assert_eq!(options.checkout_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_default_options_do_not_retry_locks() {
        let options = TenancyOptions::default();
        assert_eq!(options.lock_policy.retries, 0);
        assert_eq!(options.lock_policy.wait, Duration::from_secs(5));
    }
}

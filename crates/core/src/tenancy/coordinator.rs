//! Tenant lifecycle coordinator.
//!
//! Orchestrates provisioning and teardown of tenant namespaces:
//!
//! 1. register the tenant (`Pending`) if it is new
//! 2. take the per-tenant lock, bounded by the [`LockPolicy`]
//! 3. re-read the record under the lock and decide what is left to do
//! 4. create the schema and apply the tenant migration set
//! 5. mark `Active`, or compensate (drop the schema) and mark `Failed`
//!
//! Concurrent `provision` calls for one tenant join: the first caller does
//! the work while the rest wait on the lock, then observe `Active` and
//! return without touching the schema.

use std::future::Future;

use tessera_shared::TenantId;
use tracing::{debug, error, info, warn};

use crate::tenancy::backend::{LockGuard, TenancyBackend};
use crate::tenancy::error::TenancyError;
use crate::tenancy::migration::MigrationSet;
use crate::tenancy::provisioner::SchemaProvisioner;
use crate::tenancy::runner::MigrationRunner;
use crate::tenancy::types::{
    AppliedVersions, LockKey, LockPolicy, MigrationStatus, SchemaName, TenantRecord, TenantState,
};

/// Outcome of [`TenantLifecycleCoordinator::migrate_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Tenants that are now current, with the versions applied to each.
    pub migrated: Vec<(TenantId, AppliedVersions)>,
    /// Tenants whose upgrade failed, with the cause.
    pub failed: Vec<(TenantId, TenancyError)>,
}

impl MigrationReport {
    /// Returns true if every tenant was upgraded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A failed provisioning attempt and whether its schema must be dropped.
struct AttemptFailure {
    error: TenancyError,
    drop_schema: bool,
}

impl AttemptFailure {
    const fn keep_schema(error: TenancyError) -> Self {
        Self {
            error,
            drop_schema: false,
        }
    }

    const fn drop_schema(error: TenancyError) -> Self {
        Self {
            error,
            drop_schema: true,
        }
    }
}

/// Provisions, upgrades and tears down tenant namespaces.
#[derive(Debug, Clone)]
pub struct TenantLifecycleCoordinator<B> {
    backend: B,
    provisioner: SchemaProvisioner<B>,
    runner: MigrationRunner<B>,
    tenant_set: MigrationSet,
    lock_policy: LockPolicy,
}

impl<B: TenancyBackend> TenantLifecycleCoordinator<B> {
    /// Creates a coordinator that provisions tenants with `tenant_set`.
    #[must_use]
    pub fn new(backend: B, tenant_set: MigrationSet, lock_policy: LockPolicy) -> Self {
        Self {
            provisioner: SchemaProvisioner::new(backend.clone()),
            runner: MigrationRunner::new(backend.clone()),
            backend,
            tenant_set,
            lock_policy,
        }
    }

    /// The migration set applied to every tenant schema.
    #[must_use]
    pub const fn tenant_set(&self) -> &MigrationSet {
        &self.tenant_set
    }

    /// Looks up a tenant record.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn tenant(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, TenancyError> {
        self.backend.find(tenant_id).await
    }

    /// Lists tenant records, optionally filtered by state.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn list(&self, state: Option<TenantState>) -> Result<Vec<TenantRecord>, TenancyError> {
        self.backend.list(state).await
    }

    /// Provisions a tenant with the default lock policy.
    ///
    /// # Errors
    ///
    /// See [`Self::provision_with`].
    pub async fn provision(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError> {
        self.provision_with(tenant_id, self.lock_policy).await
    }

    /// Provisions a tenant: creates its schema and applies the tenant set.
    ///
    /// Returns the `Active` record. Provisioning an already active tenant
    /// succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// - `LockTimeout` if the tenant lock stays busy; the record is left as is
    /// - `InvalidTransition` if the tenant was deprovisioned
    /// - `MigrationFailed` (or any create failure) after compensation; the
    ///   record is `Failed` and the schema is gone
    pub async fn provision_with(
        &self,
        tenant_id: TenantId,
        policy: LockPolicy,
    ) -> Result<TenantRecord, TenancyError> {
        let record = self.backend.insert_pending(tenant_id).await?;
        if record.is_active() {
            debug!(tenant_id = %tenant_id, "Tenant already active");
            return Ok(record);
        }

        self.with_lock(LockKey::Tenant(tenant_id), policy, || {
            self.provision_locked(tenant_id)
        })
        .await
    }

    async fn provision_locked(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError> {
        let record = self
            .backend
            .find(tenant_id)
            .await?
            .ok_or(TenancyError::TenantNotFound(tenant_id))?;

        let stale = match record.state {
            TenantState::Active => {
                debug!(tenant_id = %tenant_id, "Tenant provisioned by a concurrent caller");
                return Ok(record);
            }
            TenantState::Provisioning => {
                warn!(tenant_id = %tenant_id, "Resuming an interrupted provisioning attempt");
                true
            }
            state => {
                state.transition(TenantState::Provisioning)?;
                self.backend
                    .set_state(tenant_id, TenantState::Provisioning)
                    .await?;
                state == TenantState::Failed
            }
        };

        let schema = record.schema_name;
        info!(tenant_id = %tenant_id, schema = %schema, "Provisioning tenant");

        match self.build_schema(&schema, stale).await {
            Ok(applied) => {
                let record = self
                    .backend
                    .set_state(tenant_id, TenantState::Active)
                    .await?;
                info!(
                    tenant_id = %tenant_id,
                    schema = %schema,
                    version = applied.last().unwrap_or_default(),
                    "Tenant active"
                );
                Ok(record)
            }
            Err(failure) => {
                self.compensate(tenant_id, &schema, &failure).await;
                Err(failure.error)
            }
        }
    }

    async fn build_schema(
        &self,
        schema: &SchemaName,
        stale: bool,
    ) -> Result<AppliedVersions, AttemptFailure> {
        if stale
            && self
                .provisioner
                .drop_if_exists(schema)
                .await
                .map_err(AttemptFailure::keep_schema)?
        {
            warn!(schema = %schema, "Dropped schema left by an earlier attempt");
        }

        self.provisioner.create(schema).await.map_err(|e| {
            // Nothing was created if the namespace was already there.
            if matches!(e, TenancyError::SchemaAlreadyExists(_)) {
                AttemptFailure::keep_schema(e)
            } else {
                AttemptFailure::drop_schema(e)
            }
        })?;

        self.runner
            .apply(schema, &self.tenant_set)
            .await
            .map_err(AttemptFailure::drop_schema)
    }

    /// Best-effort cleanup after a failed attempt. Never replaces the
    /// original error.
    async fn compensate(&self, tenant_id: TenantId, schema: &SchemaName, failure: &AttemptFailure) {
        warn!(
            tenant_id = %tenant_id,
            schema = %schema,
            error = %failure.error,
            "Provisioning failed, compensating"
        );

        if failure.drop_schema {
            if let Err(e) = self.provisioner.drop_if_exists(schema).await {
                error!(
                    tenant_id = %tenant_id,
                    schema = %schema,
                    error = %e,
                    "Compensating drop failed; schema will be dropped on the next attempt"
                );
            }
        }

        if let Err(e) = self.backend.set_state(tenant_id, TenantState::Failed).await {
            error!(tenant_id = %tenant_id, error = %e, "Failed to mark tenant as failed");
        }
    }

    /// Deprovisions a tenant: drops its schema and marks the record `Dropped`.
    ///
    /// Unknown and already dropped tenants succeed without doing anything.
    ///
    /// # Errors
    ///
    /// - `LockTimeout` if the tenant lock stays busy
    /// - drop failures other than a missing schema; the record stays `Dropping`
    pub async fn deprovision(&self, tenant_id: TenantId) -> Result<(), TenancyError> {
        self.deprovision_with(tenant_id, self.lock_policy).await
    }

    /// Deprovisions a tenant, waiting for its lock as `policy` allows.
    ///
    /// # Errors
    ///
    /// See [`Self::deprovision`].
    pub async fn deprovision_with(
        &self,
        tenant_id: TenantId,
        policy: LockPolicy,
    ) -> Result<(), TenancyError> {
        if self.backend.find(tenant_id).await?.is_none() {
            debug!(tenant_id = %tenant_id, "Deprovision of unknown tenant ignored");
            return Ok(());
        }

        self.with_lock(LockKey::Tenant(tenant_id), policy, || {
            self.deprovision_locked(tenant_id)
        })
        .await
    }

    async fn deprovision_locked(&self, tenant_id: TenantId) -> Result<(), TenancyError> {
        let Some(record) = self.backend.find(tenant_id).await? else {
            return Ok(());
        };

        match record.state {
            TenantState::Dropped => {
                debug!(tenant_id = %tenant_id, "Tenant already dropped");
                return Ok(());
            }
            TenantState::Dropping => {
                warn!(tenant_id = %tenant_id, "Resuming an interrupted teardown");
            }
            state => {
                state.transition(TenantState::Dropping)?;
                self.backend
                    .set_state(tenant_id, TenantState::Dropping)
                    .await?;
            }
        }

        let dropped = self.provisioner.drop_if_exists(&record.schema_name).await?;
        self.backend
            .set_state(tenant_id, TenantState::Dropped)
            .await?;
        info!(
            tenant_id = %tenant_id,
            schema = %record.schema_name,
            schema_dropped = dropped,
            "Tenant dropped"
        );
        Ok(())
    }

    /// Deletes the record of a dropped tenant. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the tenant is not `Dropped`.
    pub async fn purge(&self, tenant_id: TenantId) -> Result<bool, TenancyError> {
        self.purge_with(tenant_id, self.lock_policy).await
    }

    /// Purges a dropped tenant, waiting for its lock as `policy` allows.
    ///
    /// # Errors
    ///
    /// `LockTimeout`, or `InvalidTransition` if the tenant is not `Dropped`.
    pub async fn purge_with(&self, tenant_id: TenantId, policy: LockPolicy) -> Result<bool, TenancyError> {
        self.with_lock(LockKey::Tenant(tenant_id), policy, || async move {
            match self.backend.find(tenant_id).await? {
                None => Ok(false),
                Some(record) if record.state == TenantState::Dropped => {
                    let purged = self.backend.purge(tenant_id).await?;
                    info!(tenant_id = %tenant_id, "Tenant record purged");
                    Ok(purged)
                }
                Some(record) => Err(TenancyError::InvalidTransition {
                    from: record.state,
                    to: TenantState::Dropped,
                }),
            }
        })
        .await
    }

    /// Applies versions appended to the tenant set since an active tenant
    /// was provisioned.
    ///
    /// # Errors
    ///
    /// - `TenantNotFound` / `TenantNotActive`
    /// - runner failures; the tenant stays `Active` at the last good version
    pub async fn migrate_tenant(&self, tenant_id: TenantId) -> Result<AppliedVersions, TenancyError> {
        self.migrate_tenant_with(tenant_id, self.lock_policy).await
    }

    /// Upgrades one tenant, waiting for its lock as `policy` allows.
    ///
    /// # Errors
    ///
    /// See [`Self::migrate_tenant`].
    pub async fn migrate_tenant_with(
        &self,
        tenant_id: TenantId,
        policy: LockPolicy,
    ) -> Result<AppliedVersions, TenancyError> {
        self.with_lock(LockKey::Tenant(tenant_id), policy, || async move {
            let schema = self.active_schema(tenant_id).await?;
            let applied = self.runner.apply(&schema, &self.tenant_set).await?;
            if !applied.is_empty() {
                info!(
                    tenant_id = %tenant_id,
                    schema = %schema,
                    count = applied.len(),
                    "Tenant upgraded"
                );
            }
            Ok(applied)
        })
        .await
    }

    /// Upgrades every active tenant, one at a time. A failing tenant does
    /// not stop the others.
    ///
    /// # Errors
    ///
    /// Only if the registry cannot be listed; per-tenant failures are
    /// collected in the report.
    pub async fn migrate_all(&self) -> Result<MigrationReport, TenancyError> {
        let tenants = self.backend.list(Some(TenantState::Active)).await?;
        let mut report = MigrationReport::default();

        for record in tenants {
            match self.migrate_tenant(record.tenant_id).await {
                Ok(applied) => report.migrated.push((record.tenant_id, applied)),
                Err(e) => {
                    error!(tenant_id = %record.tenant_id, error = %e, "Tenant upgrade failed");
                    report.failed.push((record.tenant_id, e));
                }
            }
        }

        info!(
            migrated = report.migrated.len(),
            failed = report.failed.len(),
            "Tenant upgrade finished"
        );
        Ok(report)
    }

    /// Compares an active tenant's ledger with the tenant set.
    ///
    /// # Errors
    ///
    /// `TenantNotFound` / `TenantNotActive`, or ledger integrity errors.
    pub async fn migration_status(&self, tenant_id: TenantId) -> Result<MigrationStatus, TenancyError> {
        let schema = self.active_schema(tenant_id).await?;
        self.runner.status(&schema, &self.tenant_set).await
    }

    /// Applies the global set to the shared namespace under the global lock.
    ///
    /// # Errors
    ///
    /// `LockTimeout`, or runner failures.
    pub async fn bootstrap_global(&self, set: &MigrationSet) -> Result<AppliedVersions, TenancyError> {
        self.with_lock(LockKey::Global, self.lock_policy, || async move {
            self.runner.apply(&SchemaName::shared(), set).await
        })
        .await
    }

    async fn active_schema(&self, tenant_id: TenantId) -> Result<SchemaName, TenancyError> {
        let record = self
            .backend
            .find(tenant_id)
            .await?
            .ok_or(TenancyError::TenantNotFound(tenant_id))?;
        if !record.is_active() {
            return Err(TenancyError::TenantNotActive {
                tenant_id,
                state: record.state,
            });
        }
        Ok(record.schema_name)
    }

    /// Runs `f` while holding `key`. The lock is released whether `f`
    /// succeeds or fails.
    async fn with_lock<T, F, Fut>(&self, key: LockKey, policy: LockPolicy, f: F) -> Result<T, TenancyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TenancyError>>,
    {
        let guard = self.acquire(key, policy).await?;
        let result = f().await;
        if let Err(e) = guard.release().await {
            warn!(lock = %key, error = %e, "Lock release failed");
        }
        result
    }

    async fn acquire(&self, key: LockKey, policy: LockPolicy) -> Result<B::Guard, TenancyError> {
        let mut attempt = 0;
        loop {
            match self.backend.acquire(key, policy.wait).await {
                Err(TenancyError::LockTimeout(_)) if attempt < policy.retries => {
                    attempt += 1;
                    let pause = policy.backoff_for(attempt);
                    warn!(lock = %key, attempt, ?pause, "Lock busy, retrying");
                    tokio::time::sleep(pause).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

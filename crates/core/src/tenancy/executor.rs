//! Scoped executor.
//!
//! Runs one unit of work against one tenant namespace. The work receives an
//! explicit scope handle (a transaction bound to the tenant schema) instead
//! of relying on connection state, and the binding ends with the
//! transaction, before the connection goes back to the pool.

use std::time::Duration;

use futures::future::BoxFuture;
use tessera_shared::TenantId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::tenancy::backend::TenancyBackend;
use crate::tenancy::error::{TenancyError, Transient};
use crate::tenancy::types::{Access, SchemaName};

/// Failure of a scoped run: either the scoping machinery or the work itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopedError<E> {
    /// The tenant could not be resolved or a connection could not be bound.
    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    /// The work returned an error; the transaction was rolled back.
    #[error(transparent)]
    Work(E),
}

impl<E> ScopedError<E> {
    /// Returns the work error, if that is what failed.
    #[must_use]
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            Self::Tenancy(_) => None,
        }
    }

    /// Returns the tenancy error, if that is what failed.
    #[must_use]
    pub const fn as_tenancy(&self) -> Option<&TenancyError> {
        match self {
            Self::Tenancy(e) => Some(e),
            Self::Work(_) => None,
        }
    }
}

impl ScopedError<TenancyError> {
    /// Collapses both sides when the work itself fails with `TenancyError`.
    #[must_use]
    pub fn flatten(self) -> TenancyError {
        match self {
            Self::Tenancy(e) | Self::Work(e) => e,
        }
    }
}

impl<E: Transient> Transient for ScopedError<E> {
    fn is_connection_lost(&self) -> bool {
        match self {
            Self::Tenancy(e) => e.is_connection_lost(),
            Self::Work(e) => e.is_connection_lost(),
        }
    }
}

/// Routes units of work to tenant namespaces.
#[derive(Debug, Clone)]
pub struct ScopedExecutor<B> {
    backend: B,
    checkout_timeout: Duration,
}

impl<B: TenancyBackend> ScopedExecutor<B> {
    /// Creates an executor. `checkout_timeout` bounds the wait for a pooled
    /// connection.
    #[must_use]
    pub const fn new(backend: B, checkout_timeout: Duration) -> Self {
        Self {
            backend,
            checkout_timeout,
        }
    }

    /// Runs `work` in a read-write transaction bound to the tenant's schema.
    ///
    /// Commits when the work succeeds, rolls back when it fails. Never
    /// retried.
    ///
    /// # Errors
    ///
    /// - `Tenancy(TenantNotFound | TenantNotActive)` before any connection is used
    /// - `Tenancy(ConnectionLost | ScopeBindingFailed)` if binding fails
    /// - `Work(e)` with the work's own error, unchanged
    pub async fn run<T, E, F>(&self, tenant_id: TenantId, work: F) -> Result<T, ScopedError<E>>
    where
        F: for<'s> FnOnce(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.run_with_deadline(tenant_id, self.checkout_timeout, work)
            .await
    }

    /// Like [`Self::run`], waiting at most `checkout` for a connection
    /// instead of the executor's default.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_with_deadline<T, E, F>(
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
        let schema = self.resolve(tenant_id).await?;
        self.run_once(&schema, Access::ReadWrite, checkout, work).await
    }

    /// Runs `work` in a read-only transaction bound to the tenant's schema.
    ///
    /// A run that fails with a lost connection is retried once.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_read_only<T, E, F>(
        &self,
        tenant_id: TenantId,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        F: for<'s> Fn(&'s B::Scope) -> BoxFuture<'s, Result<T, E>> + Send + Sync,
        T: Send,
        E: Transient + Send,
    {
        self.run_read_only_with_deadline(tenant_id, self.checkout_timeout, work)
            .await
    }

    /// Like [`Self::run_read_only`], waiting at most `checkout` for each
    /// connection checkout.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_read_only_with_deadline<T, E, F>(
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
        let schema = self.resolve(tenant_id).await?;
        match self.run_once(&schema, Access::ReadOnly, checkout, &work).await {
            Err(e) if e.is_connection_lost() => {
                warn!(tenant_id = %tenant_id, schema = %schema, "Connection lost, retrying read-only work");
                self.run_once(&schema, Access::ReadOnly, checkout, &work).await
            }
            outcome => outcome,
        }
    }

    async fn resolve(&self, tenant_id: TenantId) -> Result<SchemaName, TenancyError> {
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

    async fn run_once<T, E, F>(
        &self,
        schema: &SchemaName,
        access: Access,
        checkout: Duration,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        F: for<'s> FnOnce(&'s B::Scope) -> BoxFuture<'s, Result<T, E>>,
    {
        let scope = tokio::time::timeout(checkout, self.backend.bind(schema, access))
            .await
            .map_err(|_| {
                TenancyError::ScopeBindingFailed(format!(
                    "no connection available within {checkout:?}"
                ))
            })??;

        match work(&scope).await {
            Ok(value) => {
                self.backend.commit(scope).await?;
                debug!(schema = %schema, ?access, "Scoped work committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.backend.rollback(scope).await {
                    warn!(schema = %schema, error = %rollback, "Rollback after failed work failed");
                }
                Err(ScopedError::Work(e))
            }
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

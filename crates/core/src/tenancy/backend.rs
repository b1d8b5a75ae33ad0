//! Storage seams of the tenancy engine.
//!
//! The engine is written against these traits. `tessera-db` implements them
//! for Postgres; [`crate::tenancy::memory`] implements them in process.

use std::time::Duration;

use async_trait::async_trait;
use tessera_shared::TenantId;

use crate::tenancy::error::TenancyError;
use crate::tenancy::migration::MigrationScript;
use crate::tenancy::types::{
    Access, LockKey, MigrationRecord, SchemaName, TenantRecord, TenantState,
};

/// Physical namespace DDL.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Returns true if the namespace exists.
    async fn schema_exists(&self, schema: &SchemaName) -> Result<bool, TenancyError>;

    /// Creates the namespace. Fails with `SchemaAlreadyExists` if present.
    async fn create_schema(&self, schema: &SchemaName) -> Result<(), TenancyError>;

    /// Drops the namespace and everything in it. Fails with `SchemaNotFound` if absent.
    async fn drop_schema(&self, schema: &SchemaName) -> Result<(), TenancyError>;
}

/// Per-schema migration ledger and script execution.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Creates the schema-qualified ledger table if it does not exist.
    async fn ensure_ledger(&self, schema: &SchemaName) -> Result<(), TenancyError>;

    /// Ledger rows, ascending by version.
    async fn applied(&self, schema: &SchemaName) -> Result<Vec<MigrationRecord>, TenancyError>;

    /// Executes a script with unqualified names resolving inside `schema`.
    async fn execute_script(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError>;

    /// Writes the ledger row for a script.
    async fn record_applied(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError>;

    /// Whether DDL and the ledger write can commit in one transaction.
    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    /// Executes a script and writes its ledger row.
    ///
    /// Backends with transactional DDL override this so both commit together.
    async fn execute_and_record(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        self.execute_script(schema, script).await?;
        self.record_applied(schema, script).await
    }
}

/// Durable tenant records in the shared namespace.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Looks up a tenant.
    async fn find(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, TenancyError>;

    /// Registers a tenant in `Pending` unless a record already exists.
    ///
    /// Returns the stored record either way; an existing record is never modified.
    async fn insert_pending(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError>;

    /// Sets the state and bumps `updated_at`. Fails with `TenantNotFound` if absent.
    async fn set_state(
        &self,
        tenant_id: TenantId,
        state: TenantState,
    ) -> Result<TenantRecord, TenancyError>;

    /// Lists records, oldest first, optionally filtered by state.
    async fn list(&self, state: Option<TenantState>) -> Result<Vec<TenantRecord>, TenancyError>;

    /// Physically deletes a record. Returns false if there was none.
    async fn purge(&self, tenant_id: TenantId) -> Result<bool, TenancyError>;
}

/// A held exclusive lock.
///
/// `release` is the normal exit. A guard dropped without it (cancellation,
/// panic) must still free the lock.
#[async_trait]
pub trait LockGuard: Send {
    /// Releases the lock.
    async fn release(self) -> Result<(), TenancyError>;
}

/// Exclusive, cooperative locks keyed by [`LockKey`].
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Guard returned on success.
    type Guard: LockGuard + 'static;

    /// Waits at most `wait` for the lock. Fails with `LockTimeout` on expiry.
    async fn acquire(&self, key: LockKey, wait: Duration) -> Result<Self::Guard, TenancyError>;
}

/// Binds pooled connections to a tenant namespace for one unit of work.
#[async_trait]
pub trait ScopeBinder: Send + Sync {
    /// Connection handle bound to one namespace, handed to the work.
    type Scope: Send + Sync;

    /// Checks out a connection and binds it to `schema`.
    async fn bind(&self, schema: &SchemaName, access: Access) -> Result<Self::Scope, TenancyError>;

    /// Commits the work and clears the binding.
    async fn commit(&self, scope: Self::Scope) -> Result<(), TenancyError>;

    /// Discards the work and clears the binding.
    async fn rollback(&self, scope: Self::Scope) -> Result<(), TenancyError>;
}

/// Everything the lifecycle coordinator and the scoped executor need.
pub trait TenancyBackend:
    SchemaCatalog + MigrationLedger + TenantRegistry + LockManager + ScopeBinder + Clone + 'static
{
}

impl<T> TenancyBackend for T where
    T: SchemaCatalog + MigrationLedger + TenantRegistry + LockManager + ScopeBinder + Clone + 'static
{
}

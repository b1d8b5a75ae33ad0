//! In-memory tenancy backend.
//!
//! Implements every storage seam without a database: namespaces are map
//! entries, scripts are recorded rather than interpreted, and scoped work
//! reads and writes JSON rows. With the `testing` feature, faults can be
//! injected to exercise the failure paths (failing scripts, failing drops,
//! lost connections).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tessera_shared::TenantId;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::tenancy::backend::{
    LockManager, MigrationLedger, SchemaCatalog, ScopeBinder, TenantRegistry,
};
use crate::tenancy::error::TenancyError;
use crate::tenancy::locks::{LocalLockGuard, LocalLockManager};
use crate::tenancy::migration::MigrationScript;
use crate::tenancy::types::{
    Access, LockKey, MigrationRecord, SchemaName, TenantRecord, TenantState,
};

type Tables = BTreeMap<String, Vec<Value>>;

/// Construction options for [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Commit each script together with its ledger row.
    pub transactional_ddl: bool,
    /// Simulated latency of every script.
    pub ddl_delay: Duration,
    /// Simulated connection pool size.
    pub pool_size: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            transactional_ddl: false,
            ddl_delay: Duration::ZERO,
            pool_size: 16,
        }
    }
}

#[derive(Debug, Default)]
struct MemorySchema {
    ledger: Option<Vec<MigrationRecord>>,
    executed: Vec<u32>,
    tables: Tables,
}

#[derive(Debug)]
struct Inner {
    options: MemoryOptions,
    schemas: DashMap<SchemaName, MemorySchema>,
    tenants: DashMap<TenantId, TenantRecord>,
    locks: LocalLockManager,
    pool: Arc<Semaphore>,
    failing_scripts: DashMap<u32, String>,
    fail_drops: AtomicBool,
    lost_connections: AtomicU32,
    open_scopes: AtomicUsize,
    schemas_created: AtomicUsize,
}

/// Tenancy backend held entirely in process memory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates a backend with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    /// Creates a backend with explicit options.
    #[must_use]
    pub fn with_options(options: MemoryOptions) -> Self {
        let schemas = DashMap::new();
        schemas.insert(SchemaName::shared(), MemorySchema::default());
        let pool = Arc::new(Semaphore::new(options.pool_size));

        Self {
            inner: Arc::new(Inner {
                options,
                schemas,
                tenants: DashMap::new(),
                locks: LocalLockManager::new(),
                pool,
                failing_scripts: DashMap::new(),
                fail_drops: AtomicBool::new(false),
                lost_connections: AtomicU32::new(0),
                open_scopes: AtomicUsize::new(0),
                schemas_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes every execution of `version` fail with `cause`.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_script(&self, version: u32, cause: impl Into<String>) {
        self.inner.failing_scripts.insert(version, cause.into());
    }

    /// Removes all script faults.
    #[cfg(any(test, feature = "testing"))]
    pub fn clear_script_faults(&self) {
        self.inner.failing_scripts.clear();
    }

    /// Makes schema drops fail until turned off again.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_drops(&self, fail: bool) {
        self.inner.fail_drops.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` connection checkouts fail with `ConnectionLost`.
    #[cfg(any(test, feature = "testing"))]
    pub fn lose_connections(&self, count: u32) {
        self.inner.lost_connections.store(count, Ordering::SeqCst);
    }

    /// Names of all existing namespaces, sorted.
    #[must_use]
    pub fn schema_names(&self) -> Vec<SchemaName> {
        let mut names: Vec<SchemaName> =
            self.inner.schemas.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns true if the namespace exists.
    #[must_use]
    pub fn has_schema(&self, schema: &SchemaName) -> bool {
        self.inner.schemas.contains_key(schema)
    }

    /// Versions whose scripts ran in `schema`, in execution order.
    #[must_use]
    pub fn executed_scripts(&self, schema: &SchemaName) -> Vec<u32> {
        self.inner
            .schemas
            .get(schema)
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    /// Committed rows of a table in `schema`.
    #[must_use]
    pub fn rows(&self, schema: &SchemaName, table: &str) -> Vec<Value> {
        self.inner
            .schemas
            .get(schema)
            .and_then(|s| s.tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Scopes currently checked out and not yet committed or rolled back.
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.inner.open_scopes.load(Ordering::SeqCst)
    }

    /// Total successful schema creations since construction.
    #[must_use]
    pub fn schemas_created(&self) -> usize {
        self.inner.schemas_created.load(Ordering::SeqCst)
    }

    fn missing(schema: &SchemaName) -> TenancyError {
        TenancyError::Database(format!("schema \"{schema}\" does not exist"))
    }

    fn take_lost_connection(&self) -> bool {
        self.inner
            .lost_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SchemaCatalog for MemoryBackend {
    async fn schema_exists(&self, schema: &SchemaName) -> Result<bool, TenancyError> {
        Ok(self.has_schema(schema))
    }

    async fn create_schema(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        match self.inner.schemas.entry(schema.clone()) {
            Entry::Occupied(_) => Err(TenancyError::SchemaAlreadyExists(schema.clone())),
            Entry::Vacant(slot) => {
                slot.insert(MemorySchema::default());
                self.inner.schemas_created.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn drop_schema(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        if self.inner.fail_drops.load(Ordering::SeqCst) {
            return Err(TenancyError::Database(format!(
                "injected failure dropping \"{schema}\""
            )));
        }
        self.inner
            .schemas
            .remove(schema)
            .map(|_| ())
            .ok_or_else(|| TenancyError::SchemaNotFound(schema.clone()))
    }
}

#[async_trait]
impl MigrationLedger for MemoryBackend {
    async fn ensure_ledger(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        let mut entry = self
            .inner
            .schemas
            .get_mut(schema)
            .ok_or_else(|| Self::missing(schema))?;
        entry.ledger.get_or_insert_with(Vec::new);
        Ok(())
    }

    async fn applied(&self, schema: &SchemaName) -> Result<Vec<MigrationRecord>, TenancyError> {
        let entry = self
            .inner
            .schemas
            .get(schema)
            .ok_or_else(|| Self::missing(schema))?;
        let mut rows = entry.ledger.clone().ok_or_else(|| missing_ledger(schema))?;
        rows.sort_by_key(|r| r.version);
        Ok(rows)
    }

    async fn execute_script(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        if !self.inner.options.ddl_delay.is_zero() {
            tokio::time::sleep(self.inner.options.ddl_delay).await;
        }
        if let Some(cause) = self.inner.failing_scripts.get(&script.version()) {
            return Err(TenancyError::Database(cause.clone()));
        }
        let mut entry = self
            .inner
            .schemas
            .get_mut(schema)
            .ok_or_else(|| Self::missing(schema))?;
        entry.executed.push(script.version());
        Ok(())
    }

    async fn record_applied(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        let mut entry = self
            .inner
            .schemas
            .get_mut(schema)
            .ok_or_else(|| Self::missing(schema))?;
        let ledger = entry.ledger.as_mut().ok_or_else(|| missing_ledger(schema))?;
        push_record(ledger, script)
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.inner.options.transactional_ddl
    }

    async fn execute_and_record(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        if !self.inner.options.transactional_ddl {
            self.execute_script(schema, script).await?;
            return self.record_applied(schema, script).await;
        }
        if !self.inner.options.ddl_delay.is_zero() {
            tokio::time::sleep(self.inner.options.ddl_delay).await;
        }
        if let Some(cause) = self.inner.failing_scripts.get(&script.version()) {
            return Err(TenancyError::Database(cause.clone()));
        }
        let mut entry = self
            .inner
            .schemas
            .get_mut(schema)
            .ok_or_else(|| Self::missing(schema))?;
        let MemorySchema {
            ledger, executed, ..
        } = &mut *entry;
        let ledger = ledger.as_mut().ok_or_else(|| missing_ledger(schema))?;
        push_record(ledger, script)?;
        executed.push(script.version());
        Ok(())
    }
}

fn missing_ledger(schema: &SchemaName) -> TenancyError {
    TenancyError::Database(format!(
        "relation \"{schema}.schema_migrations\" does not exist"
    ))
}

fn push_record(
    ledger: &mut Vec<MigrationRecord>,
    script: &MigrationScript,
) -> Result<(), TenancyError> {
    if ledger.iter().any(|r| r.version == script.version()) {
        return Err(TenancyError::Database(format!(
            "duplicate key value violates unique constraint (version)={}",
            script.version()
        )));
    }
    ledger.push(MigrationRecord {
        version: script.version(),
        checksum: script.checksum().to_string(),
        applied_at: Utc::now(),
    });
    Ok(())
}

#[async_trait]
impl TenantRegistry for MemoryBackend {
    async fn find(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, TenancyError> {
        Ok(self.inner.tenants.get(&tenant_id).map(|r| r.clone()))
    }

    async fn insert_pending(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError> {
        Ok(self
            .inner
            .tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantRecord::pending(tenant_id))
            .clone())
    }

    async fn set_state(
        &self,
        tenant_id: TenantId,
        state: TenantState,
    ) -> Result<TenantRecord, TenancyError> {
        let mut record = self
            .inner
            .tenants
            .get_mut(&tenant_id)
            .ok_or(TenancyError::TenantNotFound(tenant_id))?;
        record.state = state;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn list(&self, state: Option<TenantState>) -> Result<Vec<TenantRecord>, TenancyError> {
        let mut records: Vec<TenantRecord> = self
            .inner
            .tenants
            .iter()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.tenant_id.cmp(&b.tenant_id))
        });
        Ok(records)
    }

    async fn purge(&self, tenant_id: TenantId) -> Result<bool, TenancyError> {
        Ok(self.inner.tenants.remove(&tenant_id).is_some())
    }
}

#[async_trait]
impl LockManager for MemoryBackend {
    type Guard = LocalLockGuard;

    async fn acquire(&self, key: LockKey, wait: Duration) -> Result<Self::Guard, TenancyError> {
        self.inner.locks.acquire(key, wait).await
    }
}

/// A checked-out in-memory connection bound to one namespace.
///
/// Writes are staged and become visible to other scopes only on commit.
/// Dropping the scope without committing discards them.
#[derive(Debug)]
pub struct MemoryScope {
    schema: SchemaName,
    access: Access,
    staged: Mutex<Tables>,
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        self.inner.open_scopes.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryScope {
    /// Namespace this scope is bound to.
    #[must_use]
    pub const fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// Access mode of the scope.
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Stages a row for insertion into `table` of the bound namespace.
    ///
    /// # Errors
    ///
    /// Fails in a read-only scope.
    pub async fn insert(&self, table: &str, row: Value) -> Result<(), TenancyError> {
        if self.access == Access::ReadOnly {
            return Err(TenancyError::Database(
                "cannot execute INSERT in a read-only transaction".into(),
            ));
        }
        self.staged
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
        Ok(())
    }

    /// Reads committed rows of `table` plus rows staged by this scope.
    ///
    /// # Errors
    ///
    /// Fails if the bound namespace no longer exists.
    pub async fn select(&self, table: &str) -> Result<Vec<Value>, TenancyError> {
        let mut rows = {
            let entry = self
                .inner
                .schemas
                .get(&self.schema)
                .ok_or_else(|| MemoryBackend::missing(&self.schema))?;
            entry.tables.get(table).cloned().unwrap_or_default()
        };
        if let Some(staged) = self.staged.lock().await.get(table) {
            rows.extend(staged.iter().cloned());
        }
        Ok(rows)
    }
}

#[async_trait]
impl ScopeBinder for MemoryBackend {
    type Scope = MemoryScope;

    async fn bind(&self, schema: &SchemaName, access: Access) -> Result<Self::Scope, TenancyError> {
        let permit = Arc::clone(&self.inner.pool)
            .acquire_owned()
            .await
            .map_err(|_| TenancyError::ConnectionLost("pool closed".into()))?;
        if self.take_lost_connection() {
            return Err(TenancyError::ConnectionLost(
                "server closed the connection unexpectedly".into(),
            ));
        }
        if !self.has_schema(schema) {
            return Err(TenancyError::ScopeBindingFailed(format!(
                "schema \"{schema}\" does not exist"
            )));
        }
        self.inner.open_scopes.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryScope {
            schema: schema.clone(),
            access,
            staged: Mutex::new(Tables::new()),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn commit(&self, mut scope: Self::Scope) -> Result<(), TenancyError> {
        let staged = std::mem::take(scope.staged.get_mut());
        let schema = scope.schema.clone();
        drop(scope);
        if staged.is_empty() {
            return Ok(());
        }
        let mut entry = self
            .inner
            .schemas
            .get_mut(&schema)
            .ok_or_else(|| Self::missing(&schema))?;
        for (table, rows) in staged {
            entry.tables.entry(table).or_default().extend(rows);
        }
        Ok(())
    }

    async fn rollback(&self, scope: Self::Scope) -> Result<(), TenancyError> {
        drop(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant_schema() -> SchemaName {
        SchemaName::for_tenant(TenantId::new())
    }

    #[tokio::test]
    async fn test_shared_schema_exists_from_start() {
        let backend = MemoryBackend::new();
        assert!(backend.schema_exists(&SchemaName::shared()).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_twice_is_an_error() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        backend.create_schema(&schema).await.unwrap();
        assert_eq!(
            backend.create_schema(&schema).await,
            Err(TenancyError::SchemaAlreadyExists(schema))
        );
        assert_eq!(backend.schemas_created(), 1);
    }

    #[tokio::test]
    async fn test_drop_missing_schema_is_not_found() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        assert_eq!(
            backend.drop_schema(&schema).await,
            Err(TenancyError::SchemaNotFound(schema))
        );
    }

    #[tokio::test]
    async fn test_ledger_requires_schema() {
        let backend = MemoryBackend::new();
        assert!(backend.ensure_ledger(&tenant_schema()).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_insert_pending_keeps_existing_record() {
        let backend = MemoryBackend::new();
        let id = TenantId::new();
        backend.insert_pending(id).await.unwrap();
        backend.set_state(id, TenantState::Provisioning).await.unwrap();

        let again = backend.insert_pending(id).await.unwrap();
        assert_eq!(again.state, TenantState::Provisioning);
    }

    #[tokio::test]
    async fn test_set_state_on_unknown_tenant() {
        let backend = MemoryBackend::new();
        let id = TenantId::new();
        assert_eq!(
            backend.set_state(id, TenantState::Active).await,
            Err(TenancyError::TenantNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_scope_writes_are_visible_after_commit_only() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        backend.create_schema(&schema).await.unwrap();

        let scope = backend.bind(&schema, Access::ReadWrite).await.unwrap();
        scope.insert("accounts", json!({"code": "1000"})).await.unwrap();
        assert_eq!(scope.select("accounts").await.unwrap().len(), 1);
        assert!(backend.rows(&schema, "accounts").is_empty());

        backend.commit(scope).await.unwrap();
        assert_eq!(backend.rows(&schema, "accounts").len(), 1);
        assert_eq!(backend.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_rows() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        backend.create_schema(&schema).await.unwrap();

        let scope = backend.bind(&schema, Access::ReadWrite).await.unwrap();
        scope.insert("accounts", json!({"code": "1000"})).await.unwrap();
        backend.rollback(scope).await.unwrap();
        assert!(backend.rows(&schema, "accounts").is_empty());
    }

    #[tokio::test]
    async fn test_read_only_scope_rejects_writes() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        backend.create_schema(&schema).await.unwrap();

        let scope = backend.bind(&schema, Access::ReadOnly).await.unwrap();
        assert!(scope.insert("accounts", json!({})).await.is_err());
        backend.rollback(scope).await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connections_are_consumed() {
        let backend = MemoryBackend::new();
        let schema = tenant_schema();
        backend.create_schema(&schema).await.unwrap();
        backend.lose_connections(1);

        assert!(matches!(
            backend.bind(&schema, Access::ReadOnly).await,
            Err(TenancyError::ConnectionLost(_))
        ));
        let scope = backend.bind(&schema, Access::ReadOnly).await.unwrap();
        backend.rollback(scope).await.unwrap();
    }
}

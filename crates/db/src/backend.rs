//! Postgres implementation of the tenancy storage seams.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, FromQueryResult, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
    Unchanged, prelude::DateTimeWithTimeZone,
};
use tessera_core::TenancyError;
use tessera_core::tenancy::{
    Access, LockKey, LockManager, MigrationLedger, MigrationRecord, MigrationScript,
    SchemaCatalog, SchemaName, ScopeBinder, TenantRecord, TenantRegistry, TenantState,
};
use tessera_shared::{AppConfig, TenantId};
use tracing::debug;

use crate::entities::tenants;
use crate::error::{DUPLICATE_SCHEMA, INVALID_SCHEMA_NAME, map_db_err, sqlstate};
use crate::locks::{PgLockGuard, PgLockManager};
use crate::scope::{TenantScope, set_search_path};

/// Name of the per-schema migration ledger table.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Tenancy backend on a shared Postgres database.
#[derive(Debug, Clone)]
pub struct PgBackend {
    db: DatabaseConnection,
    locks: PgLockManager,
}

#[derive(Debug, FromQueryResult)]
struct LedgerRow {
    version: i32,
    checksum: String,
    applied_at: DateTimeWithTimeZone,
}

impl LedgerRow {
    fn into_record(self, schema: &SchemaName) -> Result<MigrationRecord, TenancyError> {
        let version = u32::try_from(self.version).map_err(|_| TenancyError::LedgerIntegrity {
            schema: schema.clone(),
            reason: format!("invalid version {}", self.version),
        })?;
        Ok(MigrationRecord {
            version,
            checksum: self.checksum,
            applied_at: self.applied_at.to_utc(),
        })
    }
}

impl PgBackend {
    /// Creates a backend. `locks` must be backed by its own pool, not by
    /// the pool behind `db`.
    #[must_use]
    pub const fn new(db: DatabaseConnection, locks: PgLockManager) -> Self {
        Self { db, locks }
    }

    /// Opens the data pool and the lock pool described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` or `Database` if either pool cannot connect.
    pub async fn connect(config: &AppConfig) -> Result<Self, TenancyError> {
        let db = crate::connect(&config.database).await.map_err(map_db_err)?;
        let locks = PgLockManager::connect(&config.database, &config.tenancy).await?;
        Ok(Self::new(db, locks))
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn insert_ledger_row<C: ConnectionTrait>(
        conn: &C,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), DbErr> {
        let version = i32::try_from(script.version())
            .map_err(|_| DbErr::Custom(format!("version {} out of range", script.version())))?;
        conn.execute(Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!(
                "INSERT INTO {} (version, checksum) VALUES ($1, $2)",
                schema.qualify(LEDGER_TABLE)
            ),
            [version.into(), script.checksum().into()],
        ))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SchemaCatalog for PgBackend {
    async fn schema_exists(&self, schema: &SchemaName) -> Result<bool, TenancyError> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1) AS present",
                [schema.as_str().into()],
            ))
            .await
            .map_err(map_db_err)?;

        match row {
            Some(row) => row.try_get::<bool>("", "present").map_err(map_db_err),
            None => Ok(false),
        }
    }

    async fn create_schema(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        self.db
            .execute_unprepared(&format!("CREATE SCHEMA {}", schema.quoted()))
            .await
            .map_err(|e| match sqlstate(&e).as_deref() {
                Some(DUPLICATE_SCHEMA) => TenancyError::SchemaAlreadyExists(schema.clone()),
                _ => map_db_err(e),
            })?;
        Ok(())
    }

    async fn drop_schema(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        self.db
            .execute_unprepared(&format!("DROP SCHEMA {} CASCADE", schema.quoted()))
            .await
            .map_err(|e| match sqlstate(&e).as_deref() {
                Some(INVALID_SCHEMA_NAME) => TenancyError::SchemaNotFound(schema.clone()),
                _ => map_db_err(e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl MigrationLedger for PgBackend {
    async fn ensure_ledger(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        self.db
            .execute_unprepared(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    version INTEGER PRIMARY KEY CHECK (version > 0),
                    checksum CHAR(64) NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                schema.qualify(LEDGER_TABLE)
            ))
            .await
            .map_err(|e| match sqlstate(&e).as_deref() {
                Some(INVALID_SCHEMA_NAME) => TenancyError::SchemaNotFound(schema.clone()),
                _ => map_db_err(e),
            })?;
        Ok(())
    }

    async fn applied(&self, schema: &SchemaName) -> Result<Vec<MigrationRecord>, TenancyError> {
        let rows = LedgerRow::find_by_statement(Statement::from_string(
            DbBackend::Postgres,
            format!(
                "SELECT version, checksum, applied_at FROM {} ORDER BY version",
                schema.qualify(LEDGER_TABLE)
            ),
        ))
        .all(&self.db)
        .await
        .map_err(map_db_err)?;

        rows.into_iter().map(|row| row.into_record(schema)).collect()
    }

    async fn execute_script(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        let txn = self.db.begin().await.map_err(map_db_err)?;
        set_search_path(&txn, schema).await.map_err(map_db_err)?;
        txn.execute_unprepared(script.sql()).await.map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)
    }

    async fn record_applied(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        Self::insert_ledger_row(&self.db, schema, script)
            .await
            .map_err(map_db_err)
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn execute_and_record(
        &self,
        schema: &SchemaName,
        script: &MigrationScript,
    ) -> Result<(), TenancyError> {
        let txn = self.db.begin().await.map_err(map_db_err)?;
        set_search_path(&txn, schema).await.map_err(map_db_err)?;
        txn.execute_unprepared(script.sql()).await.map_err(map_db_err)?;
        Self::insert_ledger_row(&txn, schema, script)
            .await
            .map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)?;

        debug!(schema = %schema, version = script.version(), "Script committed with its ledger row");
        Ok(())
    }
}

#[async_trait]
impl TenantRegistry for PgBackend {
    async fn find(&self, tenant_id: TenantId) -> Result<Option<TenantRecord>, TenancyError> {
        tenants::Entity::find_by_id(tenant_id.into_inner())
            .one(&self.db)
            .await
            .map_err(map_db_err)?
            .map(tenants::Model::into_record)
            .transpose()
    }

    async fn insert_pending(&self, tenant_id: TenantId) -> Result<TenantRecord, TenancyError> {
        let record = TenantRecord::pending(tenant_id);
        let now = record.created_at.fixed_offset();
        let model = tenants::ActiveModel {
            id: Set(tenant_id.into_inner()),
            schema_name: Set(record.schema_name.to_string()),
            state: Set(record.state.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        tenants::Entity::insert(model)
            .on_conflict(
                OnConflict::column(tenants::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(map_db_err)?;

        self.find(tenant_id)
            .await?
            .ok_or(TenancyError::TenantNotFound(tenant_id))
    }

    async fn set_state(
        &self,
        tenant_id: TenantId,
        state: TenantState,
    ) -> Result<TenantRecord, TenancyError> {
        let model = tenants::ActiveModel {
            id: Unchanged(tenant_id.into_inner()),
            state: Set(state.as_str().to_string()),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        match model.update(&self.db).await {
            Ok(updated) => updated.into_record(),
            Err(DbErr::RecordNotUpdated) => Err(TenancyError::TenantNotFound(tenant_id)),
            Err(e) => Err(map_db_err(e)),
        }
    }

    async fn list(&self, state: Option<TenantState>) -> Result<Vec<TenantRecord>, TenancyError> {
        let mut query = tenants::Entity::find();
        if let Some(state) = state {
            query = query.filter(tenants::Column::State.eq(state.as_str()));
        }

        query
            .order_by_asc(tenants::Column::CreatedAt)
            .order_by_asc(tenants::Column::Id)
            .all(&self.db)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(tenants::Model::into_record)
            .collect()
    }

    async fn purge(&self, tenant_id: TenantId) -> Result<bool, TenancyError> {
        let result = tenants::Entity::delete_by_id(tenant_id.into_inner())
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl LockManager for PgBackend {
    type Guard = PgLockGuard;

    async fn acquire(&self, key: LockKey, wait: Duration) -> Result<Self::Guard, TenancyError> {
        self.locks.acquire(key, wait).await
    }
}

#[async_trait]
impl ScopeBinder for PgBackend {
    type Scope = TenantScope;

    async fn bind(&self, schema: &SchemaName, access: Access) -> Result<Self::Scope, TenancyError> {
        TenantScope::bind(&self.db, schema, access).await
    }

    async fn commit(&self, scope: Self::Scope) -> Result<(), TenancyError> {
        scope.commit().await
    }

    async fn rollback(&self, scope: Self::Scope) -> Result<(), TenancyError> {
        scope.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ledger_row_into_record() {
        let schema = SchemaName::for_tenant(TenantId::new());
        let applied_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let row = LedgerRow {
            version: 3,
            checksum: "ab".repeat(32),
            applied_at: applied_at.fixed_offset(),
        };

        let record = row.into_record(&schema).unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.applied_at, applied_at);
    }

    #[test]
    fn test_negative_ledger_version_is_integrity_error() {
        let schema = SchemaName::for_tenant(TenantId::new());
        let row = LedgerRow {
            version: -1,
            checksum: String::new(),
            applied_at: Utc::now().fixed_offset(),
        };

        assert!(matches!(
            row.into_record(&schema),
            Err(TenancyError::LedgerIntegrity { .. })
        ));
    }
}

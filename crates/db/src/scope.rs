//! Tenant-scoped transactions.
//!
//! A [`TenantScope`] is a transaction whose `search_path` is set with
//! `SET LOCAL`, so unqualified names resolve inside one tenant schema and the
//! setting disappears with the transaction, before the connection returns
//! to the pool.
//!
//! # Usage
//!
//! ```ignore
//! use tessera_db::scope::TenantScope;
//!
//! let scope = TenantScope::bind(&db, &schema, Access::ReadWrite).await?;
//! scope.transaction().execute_unprepared("INSERT INTO accounts ...").await?;
//! scope.commit().await?;
//! ```

use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
    TransactionTrait,
};
use tessera_core::TenancyError;
use tessera_core::tenancy::{Access, SchemaName};

use crate::error::map_db_err;

/// A transaction bound to one tenant schema.
#[derive(Debug)]
pub struct TenantScope {
    txn: DatabaseTransaction,
    schema: SchemaName,
    access: Access,
}

impl TenantScope {
    /// Begins a transaction and binds it to `schema`.
    ///
    /// `SET search_path` accepts schemas that do not exist, so the binding is
    /// confirmed with `current_schema()` before the scope is handed out.
    ///
    /// # Errors
    ///
    /// - `ConnectionLost` if no connection could be checked out or it failed
    /// - `ScopeBindingFailed` if the schema is missing or the setting was rejected
    pub async fn bind(
        db: &DatabaseConnection,
        schema: &SchemaName,
        access: Access,
    ) -> Result<Self, TenancyError> {
        let txn = match access {
            Access::ReadWrite => db.begin().await,
            Access::ReadOnly => db.begin_with_config(None, Some(AccessMode::ReadOnly)).await,
        }
        .map_err(map_db_err)?;

        set_search_path(&txn, schema).await.map_err(binding_failed)?;

        let current = txn
            .query_one(Statement::from_string(
                DbBackend::Postgres,
                "SELECT current_schema() AS current",
            ))
            .await
            .map_err(binding_failed)?
            .map(|row| row.try_get::<Option<String>>("", "current"))
            .transpose()
            .map_err(binding_failed)?
            .flatten();

        if current.as_deref() != Some(schema.as_str()) {
            // Dropping the transaction rolls it back.
            return Err(TenancyError::ScopeBindingFailed(format!(
                "schema {schema} is not reachable (current_schema: {current:?})"
            )));
        }

        Ok(Self {
            txn,
            schema: schema.clone(),
            access,
        })
    }

    /// Returns the underlying transaction for executing queries.
    #[must_use]
    pub const fn transaction(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Schema this scope is bound to.
    #[must_use]
    pub const fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// Access mode of the transaction.
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub async fn commit(self) -> Result<(), TenancyError> {
        self.txn.commit().await.map_err(map_db_err)
    }

    /// Rolls back the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    pub async fn rollback(self) -> Result<(), TenancyError> {
        self.txn.rollback().await.map_err(map_db_err)
    }
}

/// Points unqualified names of the current transaction at `schema`.
///
/// # Errors
///
/// Returns the driver error if the statement fails.
pub async fn set_search_path(
    txn: &DatabaseTransaction,
    schema: &SchemaName,
) -> Result<(), sea_orm::DbErr> {
    txn.execute_unprepared(&search_path_sql(schema)).await?;
    Ok(())
}

fn search_path_sql(schema: &SchemaName) -> String {
    format!("SET LOCAL search_path TO {}", schema.quoted())
}

fn binding_failed(err: sea_orm::DbErr) -> TenancyError {
    match map_db_err(err) {
        lost @ TenancyError::ConnectionLost(_) => lost,
        other => TenancyError::ScopeBindingFailed(other.to_string()),
    }
}

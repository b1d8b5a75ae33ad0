//! Postgres backend for the Tessera tenancy engine.
//!
//! This crate provides:
//! - `SeaORM` entity for the tenant registry
//! - [`PgBackend`], implementing every storage seam of `tessera_core::tenancy`
//! - Advisory locks and tenant-scoped transactions
//! - Migrations for the shared namespace

pub mod backend;
pub mod entities;
pub mod error;
pub mod locks;
pub mod migration;
pub mod scope;

pub use backend::PgBackend;
pub use error::map_db_err;
pub use locks::{PgLockGuard, PgLockManager};
pub use scope::TenantScope;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tessera_shared::DatabaseConfig;

/// Establishes a pooled connection to the database.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

    Database::connect(options).await
}

//! Database migrations.
//!
//! Migrations are managed using sea-orm-migration. They cover the shared
//! namespace only; tenant schemas are migrated by `tessera_core`'s runner.

pub use sea_orm_migration::prelude::*;

mod m20260301_000001_tenants;

/// Migrator for the shared namespace.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20260301_000001_tenants::Migration)]
    }
}

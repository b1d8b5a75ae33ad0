//! Tenant registry migration.
//!
//! Creates the `tenants` table in the shared namespace. Tenant schemas
//! themselves are created at runtime by the provisioning engine.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(TENANTS_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared("DROP TABLE IF EXISTS public.tenants;")
            .await?;
        Ok(())
    }
}

const TENANTS_SQL: &str = r"
-- One row per tenant; the schema name is derived from the id
CREATE TABLE public.tenants (
    id UUID PRIMARY KEY,
    schema_name VARCHAR(63) NOT NULL UNIQUE,
    state VARCHAR(16) NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT chk_tenants_state CHECK (
        state IN ('pending', 'provisioning', 'active', 'dropping', 'dropped', 'failed')
    ),
    CONSTRAINT chk_tenants_schema_name CHECK (schema_name ~ '^tenant_[0-9a-f]{32}$')
);

-- Listing by state (upgrades iterate over active tenants)
CREATE INDEX idx_tenants_state ON public.tenants(state, created_at);
";

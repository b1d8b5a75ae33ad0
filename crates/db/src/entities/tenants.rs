//! `SeaORM` Entity for the tenant registry.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use tessera_core::tenancy::{SchemaName, TenantRecord, TenantState};
use tessera_core::TenancyError;
use tessera_shared::TenantId;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub schema_name: String,
    pub state: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Converts the row into a domain record.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the stored state or schema name is not valid.
    pub fn into_record(self) -> Result<TenantRecord, TenancyError> {
        let state = TenantState::parse(&self.state).ok_or_else(|| {
            TenancyError::Database(format!(
                "tenant {} has unknown state {:?}",
                self.id, self.state
            ))
        })?;
        let schema_name = SchemaName::parse(&self.schema_name)
            .map_err(|e| TenancyError::Database(format!("tenant {}: {e}", self.id)))?;

        Ok(TenantRecord {
            tenant_id: TenantId::from_uuid(self.id),
            schema_name,
            state,
            created_at: self.created_at.to_utc(),
            updated_at: self.updated_at.to_utc(),
        })
    }
}

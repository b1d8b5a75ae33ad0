//! Schema provisioner.
//!
//! Thin, logged wrapper over [`SchemaCatalog`]. Callers hold the tenant lock.

use tracing::{debug, info};

use crate::tenancy::backend::SchemaCatalog;
use crate::tenancy::error::TenancyError;
use crate::tenancy::types::SchemaName;

/// Creates and drops tenant namespaces.
#[derive(Debug, Clone)]
pub struct SchemaProvisioner<C> {
    catalog: C,
}

impl<C: SchemaCatalog> SchemaProvisioner<C> {
    /// Creates a provisioner over a catalog backend.
    #[must_use]
    pub const fn new(catalog: C) -> Self {
        Self { catalog }
    }

    /// Creates the namespace.
    ///
    /// # Errors
    ///
    /// Returns `SchemaAlreadyExists` if the namespace is already present.
    pub async fn create(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        self.catalog.create_schema(schema).await?;
        info!(schema = %schema, "Schema created");
        Ok(())
    }

    /// Drops the namespace and everything in it.
    ///
    /// # Errors
    ///
    /// Returns `SchemaNotFound` if the namespace does not exist.
    pub async fn drop(&self, schema: &SchemaName) -> Result<(), TenancyError> {
        self.catalog.drop_schema(schema).await?;
        info!(schema = %schema, "Schema dropped");
        Ok(())
    }

    /// Drops the namespace if present. Returns whether anything was dropped.
    ///
    /// # Errors
    ///
    /// Propagates any failure other than the namespace being absent.
    pub async fn drop_if_exists(&self, schema: &SchemaName) -> Result<bool, TenancyError> {
        match self.drop(schema).await {
            Ok(()) => Ok(true),
            Err(TenancyError::SchemaNotFound(_)) => {
                debug!(schema = %schema, "Schema already absent");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns true if the namespace exists.
    ///
    /// # Errors
    ///
    /// Propagates catalog failures.
    pub async fn exists(&self, schema: &SchemaName) -> Result<bool, TenancyError> {
        self.catalog.schema_exists(schema).await
    }
}

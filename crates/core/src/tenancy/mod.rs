//! Tenant provisioning and schema-scoped execution.
//!
//! Every tenant owns one Postgres schema inside a shared database. This
//! module creates, migrates and drops those schemas, tracks each tenant's
//! lifecycle, and routes units of work to the right schema.
//!
//! # Modules
//!
//! - `types` - Schema names, tenant states and records, ledger rows, lock keys
//! - `error` - Tenancy error taxonomy
//! - `migration` - Versioned scripts and validated migration sets
//! - `backend` - Storage traits implemented by `tessera-db` and `memory`
//! - `runner` - Applies a migration set to one schema
//! - `provisioner` - Creates and drops schemas
//! - `coordinator` - Provision / deprovision orchestration under per-tenant locks
//! - `executor` - Runs work in a transaction bound to a tenant schema
//! - `locks` - In-process keyed locks
//! - `memory` - In-memory backend

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod facade;
pub mod locks;
pub mod memory;
pub mod migration;
pub mod provisioner;
pub mod runner;
pub mod types;

#[cfg(test)]
mod runner_props;
#[cfg(test)]
mod types_props;

pub use backend::{
    LockGuard, LockManager, MigrationLedger, SchemaCatalog, ScopeBinder, TenancyBackend,
    TenantRegistry,
};
pub use coordinator::{MigrationReport, TenantLifecycleCoordinator};
pub use error::{TenancyError, Transient};
pub use executor::{ScopedError, ScopedExecutor};
pub use facade::{Tenancy, TenancyOptions};
pub use locks::{LocalLockGuard, LocalLockManager};
pub use memory::{MemoryBackend, MemoryOptions, MemoryScope};
pub use migration::{MigrationScript, MigrationSet};
pub use provisioner::SchemaProvisioner;
pub use runner::MigrationRunner;
pub use types::{
    Access, AppliedVersions, LockKey, LockPolicy, MigrationRecord, MigrationStatus, SchemaName,
    TenantRecord, TenantState,
};

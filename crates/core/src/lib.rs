//! Core tenancy engine for Tessera.
//!
//! This crate contains the tenant lifecycle logic with ZERO database driver
//! dependencies. Storage is reached through the traits in
//! [`tenancy::backend`]; `tessera-db` implements them for Postgres and
//! [`tenancy::memory`] implements them in process.
//!
//! # Modules
//!
//! - `tenancy` - Schema-per-tenant provisioning, migrations and scoped execution

pub mod tenancy;

pub use tenancy::{
    ScopedError, ScopedExecutor, Tenancy, TenancyError, TenancyOptions, TenantLifecycleCoordinator,
};

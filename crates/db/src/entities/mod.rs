//! `SeaORM` entities of the shared namespace.

pub mod tenants;

//! Shared types and configuration for Tessera.
//!
//! This crate provides common types used across all other crates:
//! - Typed IDs for type-safe tenant references
//! - Configuration management

pub mod config;
pub mod types;

pub use config::{AppConfig, DatabaseConfig, TenancyConfig};
pub use types::TenantId;

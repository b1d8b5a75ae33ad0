//! Tenancy error types.
//!
//! Every failure the provisioning engine and the scoped executor can
//! surface. The surrounding API layer maps them through `status_code`
//! and `error_code`.

use thiserror::Error;
use tessera_shared::TenantId;

use crate::tenancy::types::{LockKey, SchemaName, TenantState};

/// Errors raised by tenant provisioning, migration and scoped execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenancyError {
    /// Schema creation found the namespace already present.
    #[error("Schema {0} already exists")]
    SchemaAlreadyExists(SchemaName),

    /// No registry record for the tenant.
    #[error("Tenant {0} not found")]
    TenantNotFound(TenantId),

    /// The namespace to drop does not exist.
    #[error("Schema {0} not found")]
    SchemaNotFound(SchemaName),

    /// The tenant exists but is not accepting scoped work.
    #[error("Tenant {tenant_id} is not active (state: {state})")]
    TenantNotActive {
        /// The tenant that was addressed.
        tenant_id: TenantId,
        /// Its current lifecycle state.
        state: TenantState,
    },

    /// The exclusive lock could not be acquired within the allowed wait.
    #[error("Timed out acquiring lock {0}")]
    LockTimeout(LockKey),

    /// A migration script failed; later scripts were not attempted.
    #[error("Migration {version} failed: {cause}")]
    MigrationFailed {
        /// Version of the failing script.
        version: u32,
        /// Underlying cause, verbatim.
        cause: String,
    },

    /// A previously applied script no longer matches its ledger checksum.
    #[error("Migration {version} checksum mismatch (ledger: {recorded}, script: {expected})")]
    ChecksumMismatch {
        /// Version whose body changed.
        version: u32,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the script being applied.
        expected: String,
    },

    /// The ledger contents cannot be reconciled with the migration set.
    #[error("Migration ledger integrity violation in {schema}: {reason}")]
    LedgerIntegrity {
        /// Schema owning the ledger.
        schema: SchemaName,
        /// What is wrong.
        reason: String,
    },

    /// A migration set failed ordering validation.
    #[error("Invalid migration set: {0}")]
    InvalidMigrationSet(String),

    /// A string is not usable as a namespace identifier.
    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    /// The requested lifecycle step is not allowed from the current state.
    #[error("Invalid tenant state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: TenantState,
        /// Requested state.
        to: TenantState,
    },

    /// The connection went away underneath an operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A connection could not be bound to the tenant namespace.
    #[error("Scope binding failed: {0}")]
    ScopeBindingFailed(String),

    /// Any other storage failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl TenancyError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::TenantNotFound(_) | Self::SchemaNotFound(_) => 404,
            Self::SchemaAlreadyExists(_)
            | Self::TenantNotActive { .. }
            | Self::InvalidTransition { .. } => 409,
            Self::InvalidSchemaName(_) => 400,
            Self::LockTimeout(_) | Self::ConnectionLost(_) | Self::ScopeBindingFailed(_) => 503,
            Self::MigrationFailed { .. }
            | Self::ChecksumMismatch { .. }
            | Self::LedgerIntegrity { .. }
            | Self::InvalidMigrationSet(_)
            | Self::Database(_) => 500,
        }
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::SchemaAlreadyExists(_) => "SCHEMA_ALREADY_EXISTS",
            Self::TenantNotFound(_) => "TENANT_NOT_FOUND",
            Self::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            Self::TenantNotActive { .. } => "TENANT_NOT_ACTIVE",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::MigrationFailed { .. } => "MIGRATION_FAILED",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::LedgerIntegrity { .. } => "LEDGER_INTEGRITY",
            Self::InvalidMigrationSet(_) => "INVALID_MIGRATION_SET",
            Self::InvalidSchemaName(_) => "INVALID_SCHEMA_NAME",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::ScopeBindingFailed(_) => "SCOPE_BINDING_FAILED",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// True for the "absent" class of errors (`TenantNotFound`, `SchemaNotFound`).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::TenantNotFound(_) | Self::SchemaNotFound(_))
    }
}

/// Errors that can say whether they came from a dropped connection.
///
/// Read-only scoped work is retried once when its error reports a lost
/// connection.
pub trait Transient {
    /// Returns true when the failure was a lost connection.
    fn is_connection_lost(&self) -> bool;
}

impl Transient for TenancyError {
    fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

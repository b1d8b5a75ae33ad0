//! Tenancy domain types.
//!
//! Tenant records, their lifecycle state machine, namespace names and
//! migration ledger rows.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_shared::TenantId;

use crate::tenancy::error::TenancyError;

/// Prefix of every tenant namespace.
pub const TENANT_SCHEMA_PREFIX: &str = "tenant_";

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// The shared (non-tenant) namespace holding the registry and global tables.
pub const SHARED_SCHEMA: &str = "public";

/// Name of a namespace inside the shared database instance.
///
/// Tenant names are derived from the 128-bit tenant id, so two distinct
/// tenants can never map to the same namespace. Every value is a valid,
/// lowercase, unquoted Postgres identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaName(String);

impl SchemaName {
    /// Derives the namespace of a tenant: `tenant_` followed by 32 hex digits.
    #[must_use]
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self(format!("{TENANT_SCHEMA_PREFIX}{}", tenant_id.simple()))
    }

    /// The shared namespace.
    #[must_use]
    pub fn shared() -> Self {
        Self(SHARED_SCHEMA.to_string())
    }

    /// Validates an arbitrary identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchemaName` unless the name matches
    /// `[a-z_][a-z0-9_]*`, fits in 63 bytes and avoids the reserved `pg_` prefix.
    pub fn parse(name: &str) -> Result<Self, TenancyError> {
        let invalid = |reason: &str| TenancyError::InvalidSchemaName(format!("{name:?}: {reason}"));

        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return Err(invalid("empty"));
        };
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("longer than 63 bytes"));
        }
        if !(first.is_ascii_lowercase() || first == '_') {
            return Err(invalid("must start with a lowercase letter or underscore"));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(invalid("only lowercase letters, digits and underscores are allowed"));
        }
        if name.starts_with("pg_") {
            return Err(invalid("the pg_ prefix is reserved"));
        }
        Ok(Self(name.to_string()))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identifier wrapped in double quotes, ready for SQL text.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Qualifies an object name with this schema: `"schema"."object"`.
    #[must_use]
    pub fn qualify(&self, object: &str) -> String {
        format!("\"{}\".\"{}\"", self.0, object.replace('"', "\"\""))
    }

    /// True when this name was derived from a tenant id.
    #[must_use]
    pub fn is_tenant_schema(&self) -> bool {
        self.0.starts_with(TENANT_SCHEMA_PREFIX)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SchemaName {
    type Error = TenancyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SchemaName> for String {
    fn from(value: SchemaName) -> Self {
        value.0
    }
}

/// Lifecycle state of a tenant.
///
/// Valid transitions:
/// - Pending → Provisioning (lock held)
/// - Provisioning → Active | Failed
/// - Failed → Provisioning (retry)
/// - Active → Dropping → Dropped
/// - Pending | Provisioning | Failed → Dropping (tearing down a tenant that never became active)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    /// Registered, waiting for the lock.
    Pending,
    /// Schema creation and migration in progress.
    Provisioning,
    /// Fully provisioned and accepting scoped work.
    Active,
    /// Schema teardown in progress.
    Dropping,
    /// Schema removed; record kept for audit.
    Dropped,
    /// Provisioning failed and was compensated; may be retried.
    Failed,
}

impl TenantState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Provisioning,
        Self::Active,
        Self::Dropping,
        Self::Dropped,
        Self::Failed,
    ];

    /// Returns the string representation of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Dropping => "dropping",
            Self::Dropped => "dropped",
            Self::Failed => "failed",
        }
    }

    /// Parses a state from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "provisioning" => Some(Self::Provisioning),
            "active" => Some(Self::Active),
            "dropping" => Some(Self::Dropping),
            "dropped" => Some(Self::Dropped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::Provisioning)
                | (Self::Provisioning, Self::Active | Self::Failed)
                | (
                    Self::Pending | Self::Provisioning | Self::Active | Self::Failed,
                    Self::Dropping
                )
                | (Self::Dropping, Self::Dropped)
        )
    }

    /// Validates a transition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the state machine forbids it.
    pub const fn transition(self, next: Self) -> Result<Self, TenancyError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TenancyError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true if nothing can follow this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry entry for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Namespace derived from the identifier.
    pub schema_name: SchemaName,
    /// Current lifecycle state.
    pub state: TenantState,
    /// When the record was first registered.
    pub created_at: DateTime<Utc>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    /// A fresh record in `Pending`.
    #[must_use]
    pub fn pending(tenant_id: TenantId) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            schema_name: SchemaName::for_tenant(tenant_id),
            state: TenantState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the tenant accepts scoped work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TenantState::Active
    }
}

/// One row of a schema's migration ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Applied version.
    pub version: u32,
    /// SHA-256 of the script body at the time it was applied.
    pub checksum: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

/// Versions applied by one `MigrationRunner::apply` call, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedVersions(Vec<u32>);

impl AppliedVersions {
    pub(crate) fn push(&mut self, version: u32) {
        self.0.push(version);
    }

    /// The versions, ascending.
    #[must_use]
    pub fn versions(&self) -> &[u32] {
        &self.0
    }

    /// Returns true if the call applied nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of applied versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Highest version applied by the call.
    #[must_use]
    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }
}

/// Ledger contents compared against a migration set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Ledger rows, ascending.
    pub applied: Vec<MigrationRecord>,
    /// Versions in the set that are not yet in the ledger, ascending.
    pub pending: Vec<u32>,
}

impl MigrationStatus {
    /// Returns true when nothing is pending.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Identity of an exclusive administrative lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Serializes lifecycle operations of one tenant.
    Tenant(TenantId),
    /// Serializes migrations of the shared namespace.
    Global,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(id) => write!(f, "tenant:{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// How long to wait for a lock, and whether to retry after a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Bounded wait per attempt.
    pub wait: Duration,
    /// Extra attempts after a timeout. Zero surfaces the first timeout.
    pub retries: u32,
    /// Pause before the first retry; doubled on each following one.
    pub backoff: Duration,
}

impl LockPolicy {
    /// A single bounded attempt.
    #[must_use]
    pub const fn new(wait: Duration) -> Self {
        Self {
            wait,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Opts in to retrying lock timeouts.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Access mode of a scoped unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// May write; never retried.
    ReadWrite,
    /// Runs in a read-only transaction; may be retried once on connection loss.
    ReadOnly,
}

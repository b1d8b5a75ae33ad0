//! Migration runner.
//!
//! Applies a [`MigrationSet`] to one namespace and keeps that namespace's
//! ledger. The runner is stateless; callers serialize runs against the same
//! namespace (the lifecycle coordinator does so under the tenant lock).

use tracing::{debug, info, warn};

use crate::tenancy::backend::MigrationLedger;
use crate::tenancy::error::TenancyError;
use crate::tenancy::migration::MigrationSet;
use crate::tenancy::types::{AppliedVersions, MigrationRecord, MigrationStatus, SchemaName};

/// Applies migration sets through a [`MigrationLedger`].
#[derive(Debug, Clone)]
pub struct MigrationRunner<L> {
    ledger: L,
}

impl<L: MigrationLedger> MigrationRunner<L> {
    /// Creates a runner over a ledger backend.
    #[must_use]
    pub const fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Applies every script of `set` not yet recorded in the ledger of `scope`.
    ///
    /// Resumes after the last recorded version; applying an up-to-date set is
    /// a no-op. Stops at the first failing script.
    ///
    /// # Errors
    ///
    /// - `MigrationFailed` with the failing version and its cause
    /// - `ChecksumMismatch` if an applied script changed since it ran
    /// - `LedgerIntegrity` if the ledger holds versions unknown to the set or
    ///   out of sequence
    pub async fn apply(
        &self,
        scope: &SchemaName,
        set: &MigrationSet,
    ) -> Result<AppliedVersions, TenancyError> {
        self.ledger.ensure_ledger(scope).await?;
        let recorded = self.ledger.applied(scope).await?;
        let current = verify_ledger(scope, set, &recorded)?;

        let pending = set.after(current);
        if pending.is_empty() {
            debug!(schema = %scope, version = current, "Migrations up to date");
            return Ok(AppliedVersions::default());
        }

        let atomic = self.ledger.supports_transactional_ddl();
        let mut applied = AppliedVersions::default();

        for script in pending {
            let version = script.version();
            let failed = |e: TenancyError| TenancyError::MigrationFailed {
                version,
                cause: e.to_string(),
            };

            if atomic {
                self.ledger
                    .execute_and_record(scope, script)
                    .await
                    .map_err(failed)?;
            } else {
                self.ledger
                    .execute_script(scope, script)
                    .await
                    .map_err(failed)?;
                if let Err(e) = self.ledger.record_applied(scope, script).await {
                    warn!(
                        schema = %scope,
                        version,
                        error = %e,
                        "Script ran but its ledger row was not written; it will run again on retry"
                    );
                    return Err(failed(e));
                }
            }

            debug!(schema = %scope, version, name = script.name(), "Applied migration");
            applied.push(version);
        }

        info!(
            schema = %scope,
            from = current,
            to = set.latest_version(),
            count = applied.len(),
            "Migrations applied"
        );
        Ok(applied)
    }

    /// Compares the ledger of `scope` with `set` without applying anything.
    ///
    /// # Errors
    ///
    /// Same integrity errors as [`Self::apply`].
    pub async fn status(
        &self,
        scope: &SchemaName,
        set: &MigrationSet,
    ) -> Result<MigrationStatus, TenancyError> {
        self.ledger.ensure_ledger(scope).await?;
        let applied = self.ledger.applied(scope).await?;
        let current = verify_ledger(scope, set, &applied)?;
        let pending = set.after(current).iter().map(|s| s.version()).collect();
        Ok(MigrationStatus { applied, pending })
    }
}

/// Checks that the ledger is exactly the prefix `1..=k` of `set`, with
/// matching checksums, and returns `k`.
fn verify_ledger(
    scope: &SchemaName,
    set: &MigrationSet,
    recorded: &[MigrationRecord],
) -> Result<u32, TenancyError> {
    let mut current = 0;
    for record in recorded {
        let Some(script) = set.get(record.version) else {
            return Err(TenancyError::LedgerIntegrity {
                schema: scope.clone(),
                reason: format!(
                    "version {} is recorded but the set ends at {}",
                    record.version,
                    set.latest_version()
                ),
            });
        };
        if record.version != current + 1 {
            return Err(TenancyError::LedgerIntegrity {
                schema: scope.clone(),
                reason: format!(
                    "version {} is recorded after {current}",
                    record.version
                ),
            });
        }
        if record.checksum != script.checksum() {
            return Err(TenancyError::ChecksumMismatch {
                version: record.version,
                recorded: record.checksum.clone(),
                expected: script.checksum().to_string(),
            });
        }
        current = record.version;
    }
    Ok(current)
}

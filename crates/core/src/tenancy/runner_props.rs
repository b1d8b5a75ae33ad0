//! Property-based tests for MigrationRunner.
//!
//! Ledger shape after arbitrary apply histories, and where a run stops when
//! a script fails.

use proptest::prelude::*;
use tessera_shared::TenantId;

use crate::tenancy::backend::{MigrationLedger, SchemaCatalog};
use crate::tenancy::error::TenancyError;
use crate::tenancy::memory::{MemoryBackend, MemoryOptions};
use crate::tenancy::migration::{MigrationScript, MigrationSet};
use crate::tenancy::runner::MigrationRunner;
use crate::tenancy::types::SchemaName;

fn set_of(count: u32) -> MigrationSet {
    MigrationSet::new(
        (1..=count)
            .map(|v| MigrationScript::new(v, format!("step_{v}"), format!("CREATE TABLE s{v} ();")))
            .collect(),
    )
    .unwrap()
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

async fn ledger_versions(backend: &MemoryBackend, schema: &SchemaName) -> Vec<u32> {
    backend
        .applied(schema)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.version)
        .collect()
}

/// Strategy for a set size and a growing series of prefixes of it.
fn arb_history() -> impl Strategy<Value = (u32, Vec<u32>)> {
    (1u32..12).prop_flat_map(|n| (Just(n), prop::collection::vec(0..=n, 0..5)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever prefixes were applied first, the final ledger is exactly 1..=n
    /// and every script ran once.
    #[test]
    fn prop_ledger_is_contiguous_prefix((n, history) in arb_history(), atomic in any::<bool>()) {
        let (last, ledger, executed) = block_on(async {
            let backend = MemoryBackend::with_options(MemoryOptions {
                transactional_ddl: atomic,
                ..MemoryOptions::default()
            });
            let runner = MigrationRunner::new(backend.clone());
            let schema = SchemaName::for_tenant(TenantId::new());
            backend.create_schema(&schema).await.unwrap();

            let mut high = 0;
            for k in history {
                let k = k.max(high);
                runner.apply(&schema, &set_of(k)).await.unwrap();
                high = k;
            }
            let last = n.max(high);
            runner.apply(&schema, &set_of(last)).await.unwrap();
            (last, ledger_versions(&backend, &schema).await, backend.executed_scripts(&schema))
        });

        let expected: Vec<u32> = (1..=last).collect();
        prop_assert_eq!(&ledger, &expected);
        prop_assert_eq!(executed, expected);
    }

    /// Re-applying an up-to-date set applies nothing.
    #[test]
    fn prop_reapply_is_noop(n in 0u32..10) {
        let second = block_on(async {
            let backend = MemoryBackend::new();
            let runner = MigrationRunner::new(backend.clone());
            let schema = SchemaName::for_tenant(TenantId::new());
            backend.create_schema(&schema).await.unwrap();
            runner.apply(&schema, &set_of(n)).await.unwrap();
            runner.apply(&schema, &set_of(n)).await.unwrap()
        });
        prop_assert!(second.is_empty());
    }

    /// A failing script stops the run with its version; earlier ones stay recorded.
    #[test]
    fn prop_failure_stops_at_failing_version(
        (n, fail) in (1u32..10).prop_flat_map(|n| (Just(n), 1..=n)),
        atomic in any::<bool>(),
    ) {
        let (result, ledger) = block_on(async {
            let backend = MemoryBackend::with_options(MemoryOptions {
                transactional_ddl: atomic,
                ..MemoryOptions::default()
            });
            let runner = MigrationRunner::new(backend.clone());
            let schema = SchemaName::for_tenant(TenantId::new());
            backend.create_schema(&schema).await.unwrap();
            backend.fail_script(fail, "injected");
            let result = runner.apply(&schema, &set_of(n)).await;
            (result, ledger_versions(&backend, &schema).await)
        });

        match result {
            Err(TenancyError::MigrationFailed { version, .. }) => prop_assert_eq!(version, fail),
            other => prop_assert!(false, "expected MigrationFailed, got {:?}", other),
        }
        prop_assert_eq!(ledger, (1..fail).collect::<Vec<u32>>());
    }
}

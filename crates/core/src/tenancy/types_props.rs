//! Property-based tests for schema naming and the tenant state machine.

use proptest::prelude::*;
use tessera_shared::TenantId;
use uuid::Uuid;

use crate::tenancy::types::{MAX_IDENTIFIER_LEN, SchemaName, TenantState};

/// Strategy for generating arbitrary tenant ids.
fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
    any::<u128>().prop_map(|n| TenantId::from_uuid(Uuid::from_u128(n)))
}

/// Strategy for generating tenant states.
fn arb_state() -> impl Strategy<Value = TenantState> {
    prop::sample::select(TenantState::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Derived names are valid identifiers of fixed length.
    #[test]
    fn prop_derived_name_is_valid_identifier(id in arb_tenant_id()) {
        let schema = SchemaName::for_tenant(id);
        prop_assert_eq!(schema.as_str().len(), 39);
        prop_assert!(schema.as_str().len() <= MAX_IDENTIFIER_LEN);
        prop_assert_eq!(SchemaName::parse(schema.as_str()), Ok(schema.clone()));
    }

    /// Distinct tenants never share a schema.
    #[test]
    fn prop_derivation_is_injective(a in arb_tenant_id(), b in arb_tenant_id()) {
        prop_assume!(a != b);
        prop_assert_ne!(SchemaName::for_tenant(a), SchemaName::for_tenant(b));
    }

    /// `transition` agrees with `can_transition_to` and reports both ends on refusal.
    #[test]
    fn prop_transition_matches_table(from in arb_state(), to in arb_state()) {
        match from.transition(to) {
            Ok(next) => {
                prop_assert!(from.can_transition_to(to));
                prop_assert_eq!(next, to);
            }
            Err(err) => {
                prop_assert!(!from.can_transition_to(to));
                prop_assert_eq!(
                    err,
                    crate::tenancy::error::TenancyError::InvalidTransition { from, to }
                );
            }
        }
    }

    /// Nothing leaves `Dropped`, and nothing reaches `Active` except from `Provisioning`.
    #[test]
    fn prop_state_machine_edges(state in arb_state()) {
        prop_assert!(!TenantState::Dropped.can_transition_to(state));
        if state != TenantState::Provisioning {
            prop_assert!(!state.can_transition_to(TenantState::Active));
        }
    }
}

//! Property tests for the orchestrator over the in-memory backend:
//! write/read round trips, tenant isolation, and prefix listing hold
//! for arbitrary valid tenants, paths, and values.

use keel_core::{Consistency, PutOptions};
use keel_store::{MemoryBackend, Store};
use keel_test_utils::generators::{arb_nonroot_path, arb_tenant_id, arb_value};
use proptest::prelude::*;
use std::sync::Arc;

fn fresh_store() -> Store {
    Store::new(Arc::new(MemoryBackend::new()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever is written under a path reads back identically.
    #[test]
    fn prop_put_get_round_trip(
        tenant in arb_tenant_id(),
        path in arb_nonroot_path(),
        value in arb_value(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = fresh_store();
            let result = store
                .put(&tenant, &path, value.clone(), PutOptions::new())
                .await
                .unwrap();
            prop_assert!(result.success);

            let entry = store
                .get(&tenant, &path, Consistency::Default)
                .await
                .unwrap()
                .expect("written entry must exist");
            prop_assert_eq!(entry.key, path.as_str());
            prop_assert_eq!(entry.value, value);
            Ok(())
        })?;
    }

    /// A write in one tenant is invisible to every other tenant.
    #[test]
    fn prop_tenants_are_isolated(
        a in arb_tenant_id(),
        b in arb_tenant_id(),
        path in arb_nonroot_path(),
        value in arb_value(),
    ) {
        prop_assume!(a != b);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = fresh_store();
            store
                .put(&a, &path, value, PutOptions::new())
                .await
                .unwrap();

            let other = store.get(&b, &path, Consistency::Default).await.unwrap();
            prop_assert!(other.is_none());

            let listed = store
                .list(&b, &keel_core::StorePath::root(), Consistency::Default)
                .await
                .unwrap();
            prop_assert!(listed.is_empty());
            Ok(())
        })?;
    }

    /// Listing a parent prefix returns children sorted by key and maps
    /// every key back to tenant-relative form.
    #[test]
    fn prop_list_returns_sorted_relative_keys(
        tenant in arb_tenant_id(),
        base in arb_nonroot_path(),
        values in prop::collection::btree_map("[a-z0-9]{1,8}", arb_value(), 1..8),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = fresh_store();
            for (segment, value) in &values {
                let child = base.join(segment).unwrap();
                store
                    .put(&tenant, &child, value.clone(), PutOptions::new())
                    .await
                    .unwrap();
            }

            let listed = store
                .list(&tenant, &base, Consistency::Default)
                .await
                .unwrap();
            prop_assert_eq!(listed.len(), values.len());

            let mut sorted = listed.iter().map(|e| e.key.clone()).collect::<Vec<_>>();
            sorted.sort_unstable();
            let keys: Vec<String> = listed.iter().map(|e| e.key.clone()).collect();
            prop_assert_eq!(keys, sorted);

            for entry in &listed {
                prop_assert!(entry.key.starts_with(base.as_str()));
            }
            Ok(())
        })?;
    }
}

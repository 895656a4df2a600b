//! Property-based tests using proptest.
//!
//! These verify the merge invariants the whole mesh depends on: whatever
//! order publications arrive in, every store must settle on the same
//! record per key.

use std::collections::HashMap;

use proptest::prelude::*;

use kvmesh::proto::{Value, TTL_INFINITY};
use kvmesh::store::{
    compare_values, dump_difference, dump_hash_with_filters, merge_key_values, KvStoreFilters,
    ValueOrder,
};

/// The identity of a record, excluding the wall-clock TTL: the TTL value is
/// hop- and timing-dependent by design, everything else must converge.
fn incarnation(value: &Value) -> (i64, String, Option<Vec<u8>>, i64, Option<i64>) {
    (
        value.version,
        value.originator_id.clone(),
        value.value.clone(),
        value.ttl_version,
        value.hash,
    )
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..8)
}

/// Records with payloads present (the totally ordered subset).
fn arb_value() -> impl Strategy<Value = Value> {
    (
        1..4i64,
        prop::sample::select(vec!["node-a", "node-b", "node-c"]),
        arb_payload(),
        1..4i64,
    )
        .prop_map(|(version, originator, payload, ttl_version)| {
            Value::new(version, originator, Some(payload), TTL_INFINITY, ttl_version)
        })
}

fn merge_one(store: &mut HashMap<String, Value>, value: Value) -> usize {
    let mut incoming = HashMap::new();
    incoming.insert("k".to_string(), value);
    merge_key_values(store, &incoming, None).len()
}

proptest! {
    /// Merge is order-independent: merging v1 then v2 leaves the same
    /// record as merging v2 then v1. (TTL-only refreshes are excluded: a
    /// refresh against a store that never saw the value is dropped by
    /// design, so only payload-carrying records are order-free.)
    #[test]
    fn merge_commutes(v1 in arb_value(), v2 in arb_value()) {
        let mut forward = HashMap::new();
        merge_one(&mut forward, v1.clone());
        merge_one(&mut forward, v2.clone());

        let mut backward = HashMap::new();
        merge_one(&mut backward, v2);
        merge_one(&mut backward, v1);

        prop_assert_eq!(
            forward.get("k").map(incarnation),
            backward.get("k").map(incarnation)
        );
    }

    /// After merging, the stored record is at least as good as both the old
    /// record and the incoming one.
    #[test]
    fn merge_is_monotonic(v1 in arb_value(), v2 in arb_value()) {
        let mut store = HashMap::new();
        merge_one(&mut store, v1.clone());
        merge_one(&mut store, v2.clone());

        let stored = store.get("k").unwrap();
        for input in [&v1, &v2] {
            let order = compare_values(stored, input);
            prop_assert_ne!(
                order,
                ValueOrder::Second,
                "stored record lost to an input it merged"
            );
        }
    }

    /// Re-merging a record the store already holds is a no-op delta.
    #[test]
    fn merge_is_idempotent(v in arb_value()) {
        let mut store = HashMap::new();
        merge_one(&mut store, v.clone());
        prop_assert_eq!(merge_one(&mut store, v), 0);
    }

    /// The §4.1 comparison is antisymmetric on the payload-carrying subset.
    #[test]
    fn compare_values_antisymmetric(v1 in arb_value(), v2 in arb_value()) {
        let forward = compare_values(&v1, &v2);
        let backward = compare_values(&v2, &v1);
        let expected = match forward {
            ValueOrder::First => ValueOrder::Second,
            ValueOrder::Second => ValueOrder::First,
            ValueOrder::Equal => ValueOrder::Equal,
            ValueOrder::Unknown => ValueOrder::Unknown,
        };
        prop_assert_eq!(backward, expected);
    }

    /// One full three-way exchange with no concurrent writers converges
    /// both stores to the same map.
    #[test]
    fn three_way_sync_converges(
        a_batch in prop::collection::hash_map("k[0-5]", arb_value(), 0..6),
        b_batch in prop::collection::hash_map("k[0-5]", arb_value(), 0..6),
    ) {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        merge_key_values(&mut a, &a_batch, None);
        merge_key_values(&mut b, &b_batch, None);

        // A -> B: digest. B -> A: better-or-missing entries plus the keys
        // B wants back. A -> B: those keys.
        let digest = dump_hash_with_filters(&a, &KvStoreFilters::default()).key_vals;
        let response = dump_difference(&b, &digest);

        merge_key_values(&mut a, &response.key_vals, None);

        let mut finalize = HashMap::new();
        for key in response.tobe_updated_keys.unwrap_or_default() {
            if let Some(value) = a.get(&key) {
                finalize.insert(key, value.clone());
            }
        }
        merge_key_values(&mut b, &finalize, None);

        let to_map = |store: &HashMap<String, Value>| {
            let mut entries: Vec<_> = store
                .iter()
                .map(|(k, v)| (k.clone(), incarnation(v)))
                .collect();
            entries.sort();
            entries
        };
        prop_assert_eq!(to_map(&a), to_map(&b));
    }

    /// Filters are a hard gate: no rejected key ever reaches the store.
    #[test]
    fn filters_gate_merge(
        batch in prop::collection::hash_map("(adj|other):k[0-3]", arb_value(), 0..8),
    ) {
        let filters = KvStoreFilters::new(vec!["adj:".to_string()], Default::default());
        let mut store = HashMap::new();
        let applied = merge_key_values(&mut store, &batch, Some(&filters));

        for key in store.keys().chain(applied.keys()) {
            prop_assert!(key.starts_with("adj:"), "filtered key leaked: {key}");
        }
    }
}

//! Fuzz target for the merge function.
//!
//! Merge must never panic and must keep the store monotonic no matter what
//! a peer feeds it.

#![no_main]

use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;

use kvmesh::proto::Value;
use kvmesh::store::{compare_values, merge_key_values, ValueOrder};

fuzz_target!(|input: Vec<(String, i64, String, Option<Vec<u8>>, i64, i64)>| {
    let mut store = HashMap::new();

    for (key, version, originator, payload, ttl, ttl_version) in input {
        let incoming = Value {
            version,
            originator_id: originator,
            value: payload,
            ttl,
            ttl_version,
            hash: None,
        };
        let before = store.get(&key).cloned();

        let mut batch = HashMap::new();
        batch.insert(key.clone(), incoming);
        merge_key_values(&mut store, &batch, None);

        // A stored record never gets worse.
        if let (Some(old), Some(new)) = (before, store.get(&key)) {
            assert_ne!(compare_values(new, &old), ValueOrder::Second);
        }
    }
});

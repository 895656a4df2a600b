//! The in-memory store and its deterministic merge function.
//!
//! Everything here is pure: functions take the store map and inputs and
//! return the applied delta or a dump. No I/O, no timers. The actor in
//! [`crate::kvstore`] owns the map and is the only caller.
//!
//! # Merge ordering
//!
//! Two records for the same key are ordered by
//! `(version, originator_id, value bytes, ttl_version)`, in that priority.
//! The value-bytes tiebreak matters after a restart: a node that lost its
//! state can re-announce the same `(version, originator)` with different
//! bytes, and without a deterministic winner the mesh would never converge.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::trace;

use crate::proto::{hash_value, Publication, Value, TTL_INFINITY};

/// Key-prefix and originator allowlists applied on merge and dump.
///
/// Empty lists match everything. A key is accepted if it matches any prefix
/// *or* its record's originator is in the originator set.
#[derive(Debug, Clone, Default)]
pub struct KvStoreFilters {
    key_prefixes: Vec<String>,
    originator_ids: BTreeSet<String>,
}

impl KvStoreFilters {
    pub fn new(key_prefixes: Vec<String>, originator_ids: BTreeSet<String>) -> Self {
        Self {
            key_prefixes,
            originator_ids,
        }
    }

    /// Parse a comma separated prefix list, as carried in KEY_DUMP requests.
    pub fn from_prefix_string(prefix: &str, originator_ids: BTreeSet<String>) -> Self {
        let key_prefixes = prefix
            .split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(key_prefixes, originator_ids)
    }

    pub fn key_match(&self, key: &str, value: &Value) -> bool {
        if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
            return true;
        }
        if !self.key_prefixes.is_empty() && self.key_prefixes.iter().any(|p| key.starts_with(p)) {
            return true;
        }
        if !self.originator_ids.is_empty() && self.originator_ids.contains(&value.originator_id) {
            return true;
        }
        false
    }

    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    pub fn originator_ids(&self) -> &BTreeSet<String> {
        &self.originator_ids
    }
}

/// Outcome of comparing two records for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrder {
    /// The first record wins.
    First,
    /// The second record wins.
    Second,
    /// Identical under the full ordering.
    Equal,
    /// Not comparable: a payload is missing and the hashes don't settle it.
    Unknown,
}

/// Compare two records under the `(version, originator, value, ttl_version)`
/// order.
///
/// When both carry a hash and the hashes agree, the payloads are known equal
/// and the ttl_version breaks the tie. Otherwise the payload bytes are
/// compared directly; if either side lacks them the order is [`ValueOrder::Unknown`].
pub fn compare_values(v1: &Value, v2: &Value) -> ValueOrder {
    if v1.version != v2.version {
        return if v1.version > v2.version {
            ValueOrder::First
        } else {
            ValueOrder::Second
        };
    }

    if v1.originator_id != v2.originator_id {
        return if v1.originator_id > v2.originator_id {
            ValueOrder::First
        } else {
            ValueOrder::Second
        };
    }

    if let (Some(h1), Some(h2)) = (v1.hash, v2.hash) {
        if h1 == h2 {
            // Same payload; only the ttl_version can differ.
            return match v1.ttl_version.cmp(&v2.ttl_version) {
                std::cmp::Ordering::Greater => ValueOrder::First,
                std::cmp::Ordering::Less => ValueOrder::Second,
                std::cmp::Ordering::Equal => ValueOrder::Equal,
            };
        }
    }

    match (&v1.value, &v2.value) {
        (Some(b1), Some(b2)) => match b1.cmp(b2) {
            std::cmp::Ordering::Greater => ValueOrder::First,
            std::cmp::Ordering::Less => ValueOrder::Second,
            std::cmp::Ordering::Equal => ValueOrder::Equal,
        },
        _ => ValueOrder::Unknown,
    }
}

/// Merge incoming key-values into the store and return the applied delta.
///
/// The delta maps each accepted key to the incoming record, and is what gets
/// published and flooded. Pure apart from mutating `store`; never emits I/O.
pub fn merge_key_values(
    store: &mut HashMap<String, Value>,
    key_vals: &HashMap<String, Value>,
    filters: Option<&KvStoreFilters>,
) -> HashMap<String, Value> {
    let mut updates = HashMap::new();
    let mut ttl_update_cnt = 0u32;
    let mut val_update_cnt = 0u32;

    for (key, value) in key_vals {
        if let Some(filters) = filters {
            if !filters.key_match(key, value) {
                trace!(key = %key, originator = %value.originator_id, "filtered out");
                continue;
            }
        }

        // TTL must be infinite or positive.
        if value.ttl != TTL_INFINITY && value.ttl <= 0 {
            continue;
        }

        // Versions start at 1; a missing record compares as version 0 and
        // loses to anything a setter supplies.
        let my_version = store.get(key).map(|v| v.version).unwrap_or(0);
        if value.version < my_version {
            continue;
        }

        let mut update_all = false;
        let mut update_ttl = false;

        if value.value.is_some() {
            if value.version > my_version {
                update_all = true;
            } else if let Some(existing) = store.get(key) {
                if value.originator_id > existing.originator_id {
                    update_all = true;
                } else if value.originator_id == existing.originator_id {
                    // Same version and originator: a previous incarnation
                    // reflected back after a restart. Let the greater bytes
                    // win so every store settles on the same record.
                    match (&value.value, &existing.value) {
                        (Some(new_bytes), Some(old_bytes)) => match new_bytes.cmp(old_bytes) {
                            std::cmp::Ordering::Greater => update_all = true,
                            std::cmp::Ordering::Equal => {
                                if value.ttl_version > existing.ttl_version {
                                    update_ttl = true;
                                }
                            }
                            std::cmp::Ordering::Less => {}
                        },
                        _ => {}
                    }
                }
            }
        } else if let Some(existing) = store.get(key) {
            // TTL-refresh message: only bump ttl/ttl_version of the exact
            // incarnation it refers to.
            if value.version == existing.version
                && value.originator_id == existing.originator_id
                && value.ttl_version > existing.ttl_version
            {
                update_ttl = true;
            }
        }

        if !update_all && !update_ttl {
            trace!(key = %key, "nothing to update");
            continue;
        }

        if update_all {
            val_update_cnt += 1;
            let mut stored = value.clone();
            if stored.hash.is_none() {
                stored.hash = Some(hash_value(
                    stored.version,
                    &stored.originator_id,
                    stored.value.as_deref(),
                ));
            }
            store.insert(key.clone(), stored);
        } else {
            // update_ttl is only ever set for an existing entry.
            let Some(existing) = store.get_mut(key) else {
                continue;
            };
            ttl_update_cnt += 1;
            existing.ttl = value.ttl;
            existing.ttl_version = value.ttl_version;
        }

        updates.insert(key.clone(), value.clone());
    }

    trace!(
        updates = updates.len(),
        val_updates = val_update_cnt,
        ttl_updates = ttl_update_cnt,
        "merged key values"
    );
    updates
}

/// Look up the requested keys. Missing keys are silently omitted.
pub fn get_key_vals(store: &HashMap<String, Value>, keys: &[String]) -> Publication {
    let mut publication = Publication::default();
    for key in keys {
        if let Some(value) = store.get(key) {
            publication.key_vals.insert(key.clone(), value.clone());
        }
    }
    publication
}

/// Dump every entry matching the filters.
pub fn dump_all_with_filters(
    store: &HashMap<String, Value>,
    filters: &KvStoreFilters,
) -> Publication {
    let mut publication = Publication::default();
    for (key, value) in store {
        if !filters.key_match(key, value) {
            continue;
        }
        publication.key_vals.insert(key.clone(), value.clone());
    }
    publication
}

/// Dump the hash digest (no payloads) of every entry matching the filters.
pub fn dump_hash_with_filters(
    store: &HashMap<String, Value>,
    filters: &KvStoreFilters,
) -> Publication {
    let mut publication = Publication::default();
    for (key, value) in store {
        if !filters.key_match(key, value) {
            continue;
        }
        debug_assert!(value.hash.is_some(), "stored values always carry a hash");
        publication.key_vals.insert(key.clone(), value.to_hash_only());
    }
    publication
}

/// Three-way difference between my store and a peer's digest.
///
/// `key_vals` carries entries where mine is better or the peer lacks the
/// key; `tobe_updated_keys` lists keys where the peer is better or I lack
/// the key. On an [`ValueOrder::Unknown`] comparison the key goes in both
/// directions; redundant, but each side's merge resolves it
/// deterministically.
pub fn dump_difference(
    my_key_vals: &HashMap<String, Value>,
    req_key_vals: &HashMap<String, Value>,
) -> Publication {
    let mut key_vals = HashMap::new();
    let mut tobe_updated = Vec::new();

    let all_keys: HashSet<&String> = my_key_vals.keys().chain(req_key_vals.keys()).collect();

    for key in all_keys {
        match (my_key_vals.get(key), req_key_vals.get(key)) {
            (None, _) => tobe_updated.push(key.clone()),
            (Some(my_val), None) => {
                key_vals.insert(key.clone(), my_val.clone());
            }
            (Some(my_val), Some(req_val)) => match compare_values(my_val, req_val) {
                ValueOrder::First => {
                    key_vals.insert(key.clone(), my_val.clone());
                }
                ValueOrder::Second => tobe_updated.push(key.clone()),
                ValueOrder::Equal => {}
                ValueOrder::Unknown => {
                    key_vals.insert(key.clone(), my_val.clone());
                    tobe_updated.push(key.clone());
                }
            },
        }
    }

    Publication {
        key_vals,
        tobe_updated_keys: Some(tobe_updated),
        ..Default::default()
    }
}

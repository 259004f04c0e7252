//! Snapshot pin planning (`spec.md` §4.5).
//!
//! Before a view is refreshed, every source it reads from — base table or
//! another dynamic table — must be pinned to a single version so the
//! refresh sees a consistent, reproducible snapshot. Two passes decide
//! those pins, grounded on the original's `refresh_table`:
//!
//! 1. Inherit: for each direct upstream that is itself a registered dynamic
//!    table, copy the pins *it* last used, in upstream-name order. Earlier
//!    upstreams win on key conflicts (the original's `dict.update` loop,
//!    where each subsequent `dep_snapshots` merge overwrites the previous).
//! 2. Fill: any source — direct upstream or a name introduced only by
//!    inheritance — still unpinned after step 1 is pinned to the batch
//!    version `B`.

use crate::metadata::MetadataStore;
use crate::types::SnapshotPinMap;

/// Compute the pin map a refresh of `view` should use.
///
/// `direct_upstreams` is `view`'s immediate source list (as extracted by
/// [`crate::extractor`], in the order it originally appeared); `is_dynamic`
/// reports whether a given upstream name is itself a registered dynamic
/// table (only those contribute inherited pins); `batch_version` is the
/// engine's current snapshot, captured once per batch before any view in
/// it is touched (`spec.md` §4.7 step a).
pub fn plan_pins(
    metadata: &dyn MetadataStore,
    direct_upstreams: &[String],
    is_dynamic: impl Fn(&str) -> bool,
    batch_version: i64,
) -> SnapshotPinMap {
    let mut pins = SnapshotPinMap::new();

    let mut ordered_upstreams: Vec<&String> = direct_upstreams.iter().collect();
    ordered_upstreams.sort();

    for upstream in ordered_upstreams {
        if !is_dynamic(upstream) {
            continue;
        }
        if let Ok(inherited) = metadata.read_pins(upstream) {
            for (source, version) in inherited {
                pins.entry(source).or_insert(version);
            }
        }
    }

    for upstream in direct_upstreams {
        pins.entry(upstream.clone()).or_insert(batch_version);
    }

    pins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::InMemoryMetadataStore;
    use std::collections::BTreeMap;

    #[test]
    fn base_table_upstream_is_pinned_to_batch_version() {
        let store = InMemoryMetadataStore::new();
        let pins = plan_pins(&store, &["raw_sales".to_string()], |_| false, 42);
        assert_eq!(pins.get("raw_sales"), Some(&42));
    }

    #[test]
    fn dynamic_table_upstream_inherits_its_pins() {
        let store = InMemoryMetadataStore::new();
        let mut inherited = BTreeMap::new();
        inherited.insert("raw_sales".to_string(), 7i64);
        store.upsert_pins("sales_by_product", &inherited).unwrap();

        let pins = plan_pins(
            &store,
            &["sales_by_product".to_string()],
            |name| name == "sales_by_product",
            99,
        );

        assert_eq!(pins.get("raw_sales"), Some(&7));
        assert_eq!(pins.get("sales_by_product"), Some(&99));
    }

    #[test]
    fn first_upstream_in_name_order_wins_on_conflict() {
        let store = InMemoryMetadataStore::new();
        let mut pins_a = BTreeMap::new();
        pins_a.insert("shared".to_string(), 1i64);
        store.upsert_pins("view_a", &pins_a).unwrap();
        let mut pins_b = BTreeMap::new();
        pins_b.insert("shared".to_string(), 2i64);
        store.upsert_pins("view_b", &pins_b).unwrap();

        let pins = plan_pins(
            &store,
            &["view_b".to_string(), "view_a".to_string()],
            |_| true,
            50,
        );

        assert_eq!(pins.get("shared"), Some(&1));
    }

    #[test]
    fn unpinned_names_fall_back_to_batch_version() {
        let store = InMemoryMetadataStore::new();
        let pins = plan_pins(&store, &["orders".to_string(), "customers".to_string()], |_| false, 10);
        assert_eq!(pins.get("orders"), Some(&10));
        assert_eq!(pins.get("customers"), Some(&10));
    }
}

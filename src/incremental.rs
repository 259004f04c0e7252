//! Incremental (`AFFECTED_KEYS`) refresh eligibility and planning
//! (`spec.md` §4.8).
//!
//! A view qualifies for this strategy only when it declares
//! `group_by_columns` at registration (mirroring the original's
//! per-row `group_by_columns` column, not re-derived by parsing the
//! query's own `GROUP BY` on every refresh) and the engine can report
//! change-data for its upstreams. Even then, the executor falls back to
//! `FULL` whenever the affected-key ratio exceeds the configured
//! threshold — incremental refresh is a latency optimization, not a
//! correctness requirement, so "decline and do the safe thing" is always
//! a valid outcome of this module.

use crate::engine::Engine;
use crate::error::DtError;
use crate::types::{DynamicTableDef, KeyTuple, SnapshotPinMap};

/// Whether `def` is structurally eligible for `AFFECTED_KEYS` at all.
pub fn eligible(def: &DynamicTableDef) -> bool {
    def.group_by_columns.as_ref().is_some_and(|cols| !cols.is_empty())
}

/// A computed, under-threshold affected-key set ready to drive a
/// restricted delete+insert.
#[derive(Debug, Clone)]
pub struct AffectedKeysPlan {
    pub keys: Vec<KeyTuple>,
    pub ratio: f64,
}

/// Compute the affected-key set for `def`'s base-table upstreams between
/// their previous and newly planned pins, falling back to `None` (meaning
/// "use FULL") when:
/// - any upstream has no previous pin (first-ever refresh),
/// - the ratio of affected keys to the target's current row count exceeds
///   `threshold`.
///
/// Only base-table upstreams participate (`spec.md` §4.8 step 1);
/// dynamic-table upstreams are excluded since their own refresh already
/// re-derives from their bases.
pub fn compute_affected_keys(
    engine: &mut dyn Engine,
    def: &DynamicTableDef,
    is_dynamic: impl Fn(&str) -> bool,
    prev_pins: &SnapshotPinMap,
    new_pins: &SnapshotPinMap,
    target_schema: &str,
    target_name: &str,
    threshold: f64,
) -> Result<Option<AffectedKeysPlan>, DtError> {
    if !eligible(def) {
        return Ok(None);
    }
    let key_columns = def.group_by_columns.clone().expect("checked by eligible()");

    let base_upstreams: Vec<&String> = def
        .source_tables
        .iter()
        .filter(|u| !is_dynamic(u))
        .collect();
    if base_upstreams.is_empty() {
        return Ok(None);
    }

    let mut affected: Vec<KeyTuple> = Vec::new();
    for upstream in &base_upstreams {
        let upstream: &str = upstream.as_str();
        let Some(&v_prev) = prev_pins.get(upstream) else {
            return Ok(None);
        };
        let Some(&v_to) = new_pins.get(upstream) else {
            return Ok(None);
        };
        if v_to <= v_prev {
            continue;
        }
        let keys = engine.table_changes(upstream, v_prev, v_to, &key_columns)?;
        affected.extend(keys);
    }
    affected.sort();
    affected.dedup();

    if affected.is_empty() {
        return Ok(Some(AffectedKeysPlan {
            keys: affected,
            ratio: 0.0,
        }));
    }

    let cardinality = engine.row_count(target_schema, target_name)?.max(1) as f64;
    let ratio = affected.len() as f64 / cardinality;
    if ratio > threshold {
        return Ok(None);
    }

    Ok(Some(AffectedKeysPlan {
        keys: affected,
        ratio,
    }))
}

/// Render the `WHERE <key_column> IN (...)` clause this crate's
/// [`crate::engine::memory::InMemoryEngine`] and a real engine's DML both
/// accept, for a single-column key (composite keys are out of scope for
/// now — no `SPEC_FULL.md` scenario needs one).
pub fn in_list_clause(key_column: &str, keys: &[KeyTuple]) -> String {
    let values: Vec<String> = keys
        .iter()
        .filter_map(|k| k.first())
        .map(|v| format!("'{v}'"))
        .collect();
    format!("{key_column} IN ({})", values.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryEngine;
    use std::collections::BTreeMap;

    fn def() -> DynamicTableDef {
        DynamicTableDef {
            name: "customer_metrics".to_string(),
            schema_name: "main".to_string(),
            query_sql: "SELECT customer_id, COUNT(*) AS order_count FROM orders GROUP BY customer_id"
                .to_string(),
            source_tables: vec!["orders".to_string()],
            group_by_columns: Some(vec!["customer_id".to_string()]),
            cardinality_threshold: None,
        }
    }

    #[test]
    fn ineligible_without_group_by_columns() {
        let mut d = def();
        d.group_by_columns = None;
        assert!(!eligible(&d));
    }

    #[test]
    fn no_previous_pin_forces_full() {
        let mut engine = InMemoryEngine::new();
        let prev = SnapshotPinMap::new();
        let mut new = SnapshotPinMap::new();
        new.insert("orders".to_string(), 5);
        let result =
            compute_affected_keys(&mut engine, &def(), |_| false, &prev, &new, "main", "customer_metrics", 0.3)
                .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn ratio_above_threshold_falls_back_to_full() {
        let mut engine = InMemoryEngine::new();
        engine.seed_table(
            "customer_metrics",
            vec![[("customer_id".to_string(), "1".to_string())].into_iter().collect()],
        );
        engine.seed_table("orders", vec![]);
        for i in 0..5 {
            engine.record_change("orders", vec![i.to_string()]);
        }
        let mut prev = SnapshotPinMap::new();
        prev.insert("orders".to_string(), 1);
        let mut new = SnapshotPinMap::new();
        new.insert("orders".to_string(), 2);

        let result =
            compute_affected_keys(&mut engine, &def(), |_| false, &prev, &new, "main", "customer_metrics", 0.3)
                .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn under_threshold_ratio_returns_plan() {
        let mut engine = InMemoryEngine::new();
        engine.seed_table(
            "customer_metrics",
            (0..100)
                .map(|i| [("customer_id".to_string(), i.to_string())].into_iter().collect())
                .collect(),
        );
        engine.seed_table("orders", vec![]);
        engine.record_change("orders", vec!["7".to_string()]);

        let mut prev = SnapshotPinMap::new();
        prev.insert("orders".to_string(), 1);
        let mut new = SnapshotPinMap::new();
        new.insert("orders".to_string(), 2);

        let result =
            compute_affected_keys(&mut engine, &def(), |_| false, &prev, &new, "main", "customer_metrics", 0.3)
                .unwrap()
                .unwrap();
        assert_eq!(result.keys, vec![vec!["7".to_string()]]);
    }

    #[test]
    fn in_list_clause_renders_quoted_values() {
        let clause = in_list_clause("customer_id", &[vec!["1".to_string()], vec!["2".to_string()]]);
        assert_eq!(clause, "customer_id IN ('1', '2')");
    }
}

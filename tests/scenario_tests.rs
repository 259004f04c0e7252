//! End-to-end scenarios with literal values (`spec.md` §8).

use dynamic_tables::config::EngineConfig;
use dynamic_tables::engine::memory::InMemoryEngine;
use dynamic_tables::error::DtError;
use dynamic_tables::metadata::memory::InMemoryMetadataStore;
use dynamic_tables::types::{RefreshStatus, Strategy};
use dynamic_tables::DynamicTables;

fn row(pairs: &[(&str, &str)]) -> dynamic_tables::engine::memory::Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn simple_aggregation() {
    let mut engine = InMemoryEngine::new();
    engine.seed_table(
        "sales",
        vec![
            row(&[("product_id", "1"), ("amount", "100")]),
            row(&[("product_id", "1"), ("amount", "150")]),
            row(&[("product_id", "2"), ("amount", "200")]),
            row(&[("product_id", "2"), ("amount", "250")]),
        ],
    );
    let metadata = InMemoryMetadataStore::new();
    let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register(
        "sales_summary",
        "main",
        "SELECT product_id, SUM(amount) AS amount FROM sales GROUP BY product_id",
        None,
        None,
    )
    .unwrap();

    let results = dt.refresh(&[]).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RefreshStatus::Success);
    assert_eq!(results[0].rows_affected, Some(2));
    assert_eq!(results[0].strategy_used, Strategy::Full);

    let pins = metadata.read_pins("sales_summary").unwrap();
    assert_eq!(pins.get("sales"), Some(&1i64));

    let final_rows = engine.rows("sales_summary");
    assert_eq!(final_rows.len(), 2);
    let mut totals: Vec<(String, String)> = final_rows
        .iter()
        .map(|r| (r["product_id"].clone(), r["amount"].clone()))
        .collect();
    totals.sort();
    assert_eq!(
        totals,
        vec![("1".to_string(), "250".to_string()), ("2".to_string(), "450".to_string())]
    );
}

#[test]
fn cycle_rejection() {
    let mut engine = InMemoryEngine::new();
    let metadata = InMemoryMetadataStore::new();
    let dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register("a", "main", "SELECT * FROM b", None, None).unwrap();
    let err = dt.register("b", "main", "SELECT * FROM a", None, None).unwrap_err();
    assert!(matches!(err, DtError::Cycle(_)));

    // The graph is unchanged from after the first call: "b" never got in.
    assert_eq!(metadata.list().unwrap().len(), 1);
}

#[test]
fn topological_batch() {
    let mut engine = InMemoryEngine::new();
    engine.seed_table(
        "sales",
        vec![
            row(&[("product_id", "1"), ("amount", "100")]),
            row(&[("product_id", "1"), ("amount", "150")]),
            row(&[("product_id", "2"), ("amount", "200")]),
            row(&[("product_id", "2"), ("amount", "250")]),
        ],
    );
    let metadata = InMemoryMetadataStore::new();
    let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register(
        "sales_by_product",
        "main",
        "SELECT product_id, SUM(amount) AS total FROM sales GROUP BY product_id",
        None,
        None,
    )
    .unwrap();
    dt.register(
        "top_products",
        "main",
        "SELECT product_id, total FROM sales_by_product WHERE total > 200",
        None,
        None,
    )
    .unwrap();

    let results = dt.refresh(&[]).unwrap();
    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["sales_by_product", "top_products"]);

    let mut totals: Vec<(String, String)> = engine
        .rows("top_products")
        .iter()
        .map(|r| (r["product_id"].clone(), r["total"].clone()))
        .collect();
    totals.sort();
    assert_eq!(
        totals,
        vec![("1".to_string(), "250".to_string()), ("2".to_string(), "450".to_string())]
    );
}

#[test]
fn inheritance_across_a_chain() {
    let mut engine = InMemoryEngine::new();
    engine.seed_table(
        "orders",
        vec![
            row(&[("id", "1"), ("amount", "100")]),
            row(&[("id", "2"), ("amount", "200")]),
        ],
    );
    let metadata = InMemoryMetadataStore::new();
    let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register(
        "order_summary",
        "main",
        "SELECT COUNT(*) AS order_count, SUM(amount) AS total_amount FROM orders",
        None,
        None,
    )
    .unwrap();
    dt.refresh(&["order_summary".to_string()]).unwrap();

    // New version of `orders`, observed only by a future refresh.
    engine.seed_table(
        "orders",
        vec![
            row(&[("id", "1"), ("amount", "100")]),
            row(&[("id", "2"), ("amount", "200")]),
            row(&[("id", "3"), ("amount", "300")]),
        ],
    );

    dt.register(
        "order_validation",
        "main",
        "SELECT order_summary.order_count, order_summary.total_amount FROM order_summary CROSS JOIN orders",
        None,
        None,
    )
    .unwrap();

    let results = dt.refresh(&["order_validation".to_string()]).unwrap();
    assert_eq!(results[0].status, RefreshStatus::Success);

    let rows = engine.rows("order_validation");
    assert_eq!(rows.len(), 2, "one row per order pinned at order_summary's version");
    assert!(rows.iter().all(|r| r["order_count"] == "2" && r["total_amount"] == "300"));
}

#[test]
fn conflict_expansion_reconciles_disagreeing_sibling_pins() {
    let mut engine = InMemoryEngine::new();
    engine.seed_table("orders", vec![row(&[("id", "1")])]);
    let metadata = InMemoryMetadataStore::new();
    let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register("b", "main", "SELECT id FROM orders", None, None).unwrap();
    dt.register("c", "main", "SELECT id FROM orders", None, None).unwrap();
    dt.register(
        "d",
        "main",
        "SELECT b.id FROM b JOIN c ON b.id = c.id",
        None,
        None,
    )
    .unwrap();

    dt.refresh(&["b".to_string()]).unwrap();
    engine.seed_table("orders", vec![row(&[("id", "1")]), row(&[("id", "2")])]);
    dt.refresh(&["c".to_string()]).unwrap();

    let pin_b = metadata.read_pins("b").unwrap();
    let pin_c = metadata.read_pins("c").unwrap();
    assert_ne!(pin_b.get("orders"), pin_c.get("orders"));

    let results = dt.refresh(&["d".to_string()]).unwrap();
    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c", "d"]);

    let pin_b = metadata.read_pins("b").unwrap();
    let pin_c = metadata.read_pins("c").unwrap();
    assert_eq!(pin_b.get("orders"), pin_c.get("orders"));
}

#[test]
fn incremental_with_affected_keys() {
    let mut engine = InMemoryEngine::new();
    engine.seed_table(
        "orders",
        vec![
            row(&[("order_id", "1"), ("customer_id", "100"), ("amount", "10")]),
            row(&[("order_id", "2"), ("customer_id", "200"), ("amount", "20")]),
            row(&[("order_id", "3"), ("customer_id", "300"), ("amount", "30")]),
            row(&[("order_id", "4"), ("customer_id", "100"), ("amount", "40")]),
        ],
    );
    let metadata = InMemoryMetadataStore::new();
    let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

    dt.register(
        "customer_metrics",
        "main",
        "SELECT customer_id, SUM(amount) AS total FROM orders GROUP BY customer_id",
        Some(vec!["customer_id".to_string()]),
        None,
    )
    .unwrap();

    let bootstrap = dt.refresh(&[]).unwrap();
    assert_eq!(bootstrap[0].strategy_used, Strategy::Full);

    engine.seed_table(
        "orders",
        vec![
            row(&[("order_id", "1"), ("customer_id", "400"), ("amount", "10")]),
            row(&[("order_id", "2"), ("customer_id", "200"), ("amount", "20")]),
            row(&[("order_id", "3"), ("customer_id", "300"), ("amount", "30")]),
            row(&[("order_id", "4"), ("customer_id", "100"), ("amount", "40")]),
        ],
    );
    engine.record_change("orders", vec!["400".to_string()]);
    engine.record_change("orders", vec!["100".to_string()]);

    let second = dt.refresh(&[]).unwrap();
    assert_eq!(second[0].strategy_used, Strategy::AffectedKeys);

    let history = metadata.history();
    let last = history.last().unwrap();
    assert_eq!(last.affected_keys_count, Some(2));
}

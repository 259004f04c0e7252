//! Snapshot-pin query rewriting (`spec.md` §4.4).
//!
//! Given a query and a map of source name -> version, rewrites every
//! matching table reference to `name AT (VERSION => v)` (alias, if any,
//! stays between the name and the pin: `name AS alias AT (VERSION => v)`).
//! References bound by the query's own `WITH` clause are left untouched.
//!
//! `sqlparser` has no AST node for this vendor-style time-travel clause, so
//! rather than hand-rolling a full SQL pretty-printer, each node's own
//! `Display` output is used as-is and only the handful of sub-strings that
//! must change are located and replaced. This mirrors the original
//! implementation's approach of letting its SQL library serialize the
//! query and then patching up the one place its printer ordered things
//! differently than the target engine expects.
//!
//! Splicing is done left-to-right with an advancing byte cursor rather than
//! a fresh `replacen(original, rewritten, 1)` search from the start of the
//! string each time: two sibling sub-expressions can render to
//! byte-identical text (`WITH a AS (SELECT * FROM t), b AS (SELECT * FROM
//! t) ...`, `SELECT * FROM t UNION ALL SELECT * FROM t`), and a rewritten
//! fragment always has its un-pinned original as a literal prefix
//! (`"{base} AT (VERSION => {v})"`). Searching from the start every time
//! would match that prefix inside the first occurrence's own replacement
//! instead of advancing to the second occurrence, double-pinning the first
//! and leaving the second untouched. Each splice instead searches only at
//! or after the end of the previous one.

use std::collections::HashMap;

use sqlparser::ast::{
    Join, Query, Select, SetExpr, TableFactor, TableWithJoins,
};

use crate::error::DtError;
use crate::extractor::{as_query, collect_cte_names, format_object_name, parse_single_statement};

/// Rewrite `sql` so that every reference to a name present in `pins` is
/// pinned to its version. Names not present in `pins`, and names bound by
/// a `WITH` clause, are left unpinned. An empty `pins` map returns the
/// query unchanged (modulo `sqlparser`'s own canonical formatting).
pub fn apply_pins(sql: &str, pins: &HashMap<String, i64>) -> Result<String, DtError> {
    let statement = parse_single_statement(sql)?;
    let query = as_query(&statement)?;
    if pins.is_empty() {
        return Ok(query.to_string());
    }
    let cte_names = collect_cte_names(query);
    Ok(rewrite_query(query, pins, &cte_names))
}

/// Find `original` in `base` at or after byte offset `from`, replace that
/// occurrence with `rewritten`, and return the new string along with the
/// byte offset just past the replacement, so the next sibling splice
/// never searches backward into territory this one already rewrote.
fn splice_after(base: &str, original: &str, rewritten: &str, from: usize) -> (String, usize) {
    let Some(rel) = base.get(from..).and_then(|tail| tail.find(original)) else {
        return (base.to_string(), from);
    };
    let start = from + rel;
    let end = start + original.len();
    let mut out = String::with_capacity(base.len() - original.len() + rewritten.len());
    out.push_str(&base[..start]);
    out.push_str(rewritten);
    out.push_str(&base[end..]);
    let cursor = start + rewritten.len();
    (out, cursor)
}

fn rewrite_query(query: &Query, pins: &HashMap<String, i64>, cte_names: &std::collections::HashSet<String>) -> String {
    let mut base = query.to_string();
    let mut cursor = 0;

    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let original = cte.query.to_string();
            let rewritten = rewrite_query(&cte.query, pins, cte_names);
            let (next_base, next_cursor) = splice_after(&base, &original, &rewritten, cursor);
            base = next_base;
            cursor = next_cursor;
        }
    }

    let body_original = query.body.to_string();
    let body_rewritten = rewrite_set_expr(&query.body, pins, cte_names);
    splice_after(&base, &body_original, &body_rewritten, cursor).0
}

fn rewrite_set_expr(
    body: &SetExpr,
    pins: &HashMap<String, i64>,
    cte_names: &std::collections::HashSet<String>,
) -> String {
    match body {
        SetExpr::Select(select) => rewrite_select(select, pins, cte_names),
        SetExpr::Query(q) => rewrite_query(q, pins, cte_names),
        SetExpr::SetOperation { left, right, .. } => {
            let base = body.to_string();
            let left_original = left.to_string();
            let left_rewritten = rewrite_set_expr(left, pins, cte_names);
            let (base, cursor) = splice_after(&base, &left_original, &left_rewritten, 0);

            let right_original = right.to_string();
            let right_rewritten = rewrite_set_expr(right, pins, cte_names);
            splice_after(&base, &right_original, &right_rewritten, cursor).0
        }
        other => other.to_string(),
    }
}

fn rewrite_select(
    select: &Select,
    pins: &HashMap<String, i64>,
    cte_names: &std::collections::HashSet<String>,
) -> String {
    let mut base = select.to_string();
    let mut cursor = 0;
    for twj in &select.from {
        let original = twj.to_string();
        let rewritten = rewrite_table_with_joins(twj, pins, cte_names);
        let (next_base, next_cursor) = splice_after(&base, &original, &rewritten, cursor);
        base = next_base;
        cursor = next_cursor;
    }
    base
}

fn rewrite_table_with_joins(
    twj: &TableWithJoins,
    pins: &HashMap<String, i64>,
    cte_names: &std::collections::HashSet<String>,
) -> String {
    let base = twj.to_string();

    let relation_original = twj.relation.to_string();
    let relation_rewritten = rewrite_table_factor(&twj.relation, pins, cte_names);
    let (mut base, mut cursor) = splice_after(&base, &relation_original, &relation_rewritten, 0);

    for join in &twj.joins {
        let join_original = join.to_string();
        let join_rewritten = rewrite_join(join, pins, cte_names);
        let (next_base, next_cursor) = splice_after(&base, &join_original, &join_rewritten, cursor);
        base = next_base;
        cursor = next_cursor;
    }
    base
}

fn rewrite_join(
    join: &Join,
    pins: &HashMap<String, i64>,
    cte_names: &std::collections::HashSet<String>,
) -> String {
    let base = join.to_string();
    let relation_original = join.relation.to_string();
    let relation_rewritten = rewrite_table_factor(&join.relation, pins, cte_names);
    splice_after(&base, &relation_original, &relation_rewritten, 0).0
}

fn rewrite_table_factor(
    tf: &TableFactor,
    pins: &HashMap<String, i64>,
    cte_names: &std::collections::HashSet<String>,
) -> String {
    match tf {
        TableFactor::Table { name, .. } => {
            let base = tf.to_string();
            let rendered = format_object_name(name);
            let bare = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
            if cte_names.contains(&bare) || cte_names.contains(&rendered) {
                return base;
            }
            let pin = pins.get(&rendered).or_else(|| pins.get(&bare));
            match pin {
                Some(version) => format!("{base} AT (VERSION => {version})"),
                None => base,
            }
        }
        TableFactor::Derived { subquery, .. } => {
            let base = tf.to_string();
            let original = subquery.to_string();
            let rewritten = rewrite_query(subquery, pins, cte_names);
            splice_after(&base, &original, &rewritten, 0).0
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let base = tf.to_string();
            let original = table_with_joins.to_string();
            let rewritten = rewrite_table_with_joins(table_with_joins, pins, cte_names);
            splice_after(&base, &original, &rewritten, 0).0
        }
        other => other.to_string(),
    }
}

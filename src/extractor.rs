//! Source-table extraction from a SQL query (`spec.md` §4.1).
//!
//! Parses the query with `sqlparser`'s generic dialect and returns the
//! lexicographically sorted, deduplicated set of table identifiers
//! referenced at any nesting level — subqueries, joins, and set operations
//! are all traversed. Names bound by the query's own `WITH` clause (CTEs)
//! are excluded, since they do not name a real source table.

use std::collections::{BTreeSet, HashSet};

use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectName, Query, Select,
    SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::DtError;

/// Parse `sql` and return the single statement it contains.
///
/// A dynamic table's defining query is a single `SELECT` (optionally with a
/// leading `WITH` clause or set operations); anything else — or a query
/// that fails to parse at all — is rejected as `BadQuery`.
pub(crate) fn parse_single_statement(sql: &str) -> Result<Statement, DtError> {
    let dialect = GenericDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| DtError::BadQuery(e.to_string()))?;
    if statements.len() != 1 {
        return Err(DtError::BadQuery(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

/// Unwrap a parsed `Statement` into the `Query` it must be for a dynamic
/// table's defining query.
pub(crate) fn as_query(statement: &Statement) -> Result<&Query, DtError> {
    match statement {
        Statement::Query(q) => Ok(q.as_ref()),
        other => Err(DtError::BadQuery(format!(
            "expected a SELECT/query statement, found: {other}"
        ))),
    }
}

/// Collect every CTE alias name bound anywhere in `query`, at any nesting
/// level. Used both by the extractor (to exclude CTE names from the
/// returned source-table set) and the rewriter (to skip pinning references
/// to a CTE).
pub(crate) fn collect_cte_names(query: &Query) -> HashSet<String> {
    let mut names = HashSet::new();
    walk_query(query, &mut |ctx, q| {
        if ctx == WalkCtx::CteBinding {
            if let Some(name) = q.cte_name.take() {
                names_insert(&mut names, name);
            }
        }
    });
    names
}

fn names_insert(names: &mut HashSet<String>, name: String) {
    names.insert(name);
}

// The CTE-collection walk below is intentionally separate from the
// table-collection walk (`walk_query_tables`) even though both traverse the
// same tree shape, because they collect different things at different
// nodes. A generic visitor would need a trait object per callback; a direct
// dual-purpose recursion reads clearer for a tree this small.
#[derive(PartialEq, Eq, Clone, Copy)]
enum WalkCtx {
    CteBinding,
}

struct QCtx {
    cte_name: Option<String>,
}

fn walk_query(query: &Query, visit: &mut impl FnMut(WalkCtx, &mut QCtx)) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let mut ctx = QCtx {
                cte_name: Some(cte.alias.name.value.clone()),
            };
            visit(WalkCtx::CteBinding, &mut ctx);
            walk_query(&cte.query, visit);
        }
    }
    walk_set_expr(&query.body, visit);
}

fn walk_set_expr(body: &SetExpr, visit: &mut impl FnMut(WalkCtx, &mut QCtx)) {
    match body {
        SetExpr::Select(select) => walk_select(select, visit),
        SetExpr::Query(q) => walk_query(q, visit),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, visit);
            walk_set_expr(right, visit);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, visit: &mut impl FnMut(WalkCtx, &mut QCtx)) {
    for twj in &select.from {
        walk_table_factor(&twj.relation, visit);
        for join in &twj.joins {
            walk_table_factor(&join.relation, visit);
        }
    }
}

fn walk_table_factor(tf: &TableFactor, visit: &mut impl FnMut(WalkCtx, &mut QCtx)) {
    match tf {
        TableFactor::Derived { subquery, .. } => walk_query(subquery, visit),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_table_factor(&table_with_joins.relation, visit);
            for join in &table_with_joins.joins {
                walk_table_factor(&join.relation, visit);
            }
        }
        _ => {}
    }
}

/// Render an `ObjectName` the way `spec.md` §4.1 requires: `schema.name`
/// when a schema qualifier is present in the query, `name` otherwise.
/// Identifiers are taken verbatim (no case-folding), matching the
/// original's behavior of treating the query's own casing as authoritative.
pub(crate) fn format_object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// Extract the sorted, deduplicated set of source-table identifiers
/// referenced anywhere in `sql` — in the top-level `FROM`, in joins, in
/// subqueries (derived tables, `IN`/`EXISTS`/scalar subqueries), and on
/// either side of a set operation. CTE names bound by the query's own
/// `WITH` clause are excluded.
pub fn extract_source_tables(sql: &str) -> Result<Vec<String>, DtError> {
    let statement = parse_single_statement(sql)?;
    let query = as_query(&statement)?;

    let cte_names = collect_cte_names(query);
    let mut found = BTreeSet::new();
    walk_query_tables(query, &cte_names, &mut found);
    Ok(found.into_iter().collect())
}

fn walk_query_tables(query: &Query, cte_names: &HashSet<String>, found: &mut BTreeSet<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query_tables(&cte.query, cte_names, found);
        }
    }
    walk_set_expr_tables(&query.body, cte_names, found);
}

fn walk_set_expr_tables(
    body: &SetExpr,
    cte_names: &HashSet<String>,
    found: &mut BTreeSet<String>,
) {
    match body {
        SetExpr::Select(select) => walk_select_tables(select, cte_names, found),
        SetExpr::Query(q) => walk_query_tables(q, cte_names, found),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr_tables(left, cte_names, found);
            walk_set_expr_tables(right, cte_names, found);
        }
        _ => {}
    }
}

fn walk_select_tables(select: &Select, cte_names: &HashSet<String>, found: &mut BTreeSet<String>) {
    for twj in &select.from {
        walk_table_factor_tables(&twj.relation, cte_names, found);
        for join in &twj.joins {
            walk_table_factor_tables(&join.relation, cte_names, found);
            if let Some(expr) = join_constraint_expr(&join.join_operator) {
                walk_expr_tables(expr, cte_names, found);
            }
        }
    }
    if let Some(selection) = &select.selection {
        walk_expr_tables(selection, cte_names, found);
    }
    if let Some(having) = &select.having {
        walk_expr_tables(having, cte_names, found);
    }
    for item in &select.projection {
        if let Some(expr) = select_item_expr(item) {
            walk_expr_tables(expr, cte_names, found);
        }
    }
}

fn select_item_expr(item: &sqlparser::ast::SelectItem) -> Option<&Expr> {
    use sqlparser::ast::SelectItem;
    match item {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Some(e),
        _ => None,
    }
}

fn join_constraint_expr(op: &sqlparser::ast::JoinOperator) -> Option<&Expr> {
    use sqlparser::ast::{JoinConstraint, JoinOperator};
    let constraint = match op {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return None,
    };
    match constraint {
        JoinConstraint::On(e) => Some(e),
        _ => None,
    }
}

fn walk_table_factor_tables(
    tf: &TableFactor,
    cte_names: &HashSet<String>,
    found: &mut BTreeSet<String>,
) {
    match tf {
        TableFactor::Table { name, .. } => {
            let rendered = format_object_name(name);
            let bare = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
            if !cte_names.contains(&bare) && !cte_names.contains(&rendered) {
                found.insert(rendered);
            }
        }
        TableFactor::Derived { subquery, .. } => walk_query_tables(subquery, cte_names, found),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_table_factor_tables(&table_with_joins.relation, cte_names, found);
            for join in &table_with_joins.joins {
                walk_table_factor_tables(&join.relation, cte_names, found);
            }
        }
        _ => {}
    }
}

fn walk_expr_tables(expr: &Expr, cte_names: &HashSet<String>, found: &mut BTreeSet<String>) {
    match expr {
        Expr::Subquery(q) | Expr::InSubquery { subquery: q, .. } => {
            walk_query_tables(q, cte_names, found)
        }
        Expr::Exists { subquery, .. } => walk_query_tables(subquery, cte_names, found),
        Expr::BinaryOp { left, right, .. } => {
            walk_expr_tables(left, cte_names, found);
            walk_expr_tables(right, cte_names, found);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            walk_expr_tables(expr, cte_names, found)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr_tables(expr, cte_names, found);
            walk_expr_tables(low, cte_names, found);
            walk_expr_tables(high, cte_names, found);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr_tables(expr, cte_names, found);
            for e in list {
                walk_expr_tables(e, cte_names, found);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
            ..
        } => {
            if let Some(e) = operand {
                walk_expr_tables(e, cte_names, found);
            }
            for c in conditions {
                walk_expr_tables(c, cte_names, found);
            }
            for r in results {
                walk_expr_tables(r, cte_names, found);
            }
            if let Some(e) = else_result {
                walk_expr_tables(e, cte_names, found);
            }
        }
        Expr::Tuple(items) => {
            for e in items {
                walk_expr_tables(e, cte_names, found);
            }
        }
        Expr::Function(func) => walk_function_tables(func, cte_names, found),
        _ => {}
    }
}

fn walk_function_tables(func: &Function, cte_names: &HashSet<String>, found: &mut BTreeSet<String>) {
    if let FunctionArguments::List(list) = &func.args {
        for arg in &list.args {
            let arg_expr = match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
                FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => Some(e),
                _ => None,
            };
            if let Some(e) = arg_expr {
                walk_expr_tables(e, cte_names, found);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_table() {
        let tables = extract_source_tables("SELECT * FROM sales").unwrap();
        assert_eq!(tables, vec!["sales"]);
    }

    #[test]
    fn join_collects_all_tables() {
        let tables = extract_source_tables(
            "SELECT o.id, c.name, SUM(oi.amount) AS total \
             FROM orders o \
             JOIN customers c ON o.customer_id = c.id \
             JOIN order_items oi ON o.id = oi.order_id \
             GROUP BY o.id, c.name",
        )
        .unwrap();
        assert_eq!(tables, vec!["customers", "order_items", "orders"]);
    }

    #[test]
    fn schema_qualified_names_are_preserved() {
        let tables = extract_source_tables(
            "SELECT * FROM analytics.events JOIN main.users ON events.user_id = users.id",
        )
        .unwrap();
        assert_eq!(tables, vec!["analytics.events", "main.users"]);
    }

    #[test]
    fn subquery_in_from_is_traversed() {
        let tables = extract_source_tables(
            "SELECT * FROM (SELECT * FROM sales) s JOIN customers c ON s.customer_id = c.id",
        )
        .unwrap();
        assert_eq!(tables, vec!["customers", "sales"]);
    }

    #[test]
    fn cte_name_is_excluded_but_its_source_is_not() {
        let tables = extract_source_tables(
            "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent",
        )
        .unwrap();
        assert_eq!(tables, vec!["orders"]);
    }

    #[test]
    fn set_operation_traverses_both_sides() {
        let tables =
            extract_source_tables("SELECT id FROM a UNION ALL SELECT id FROM b").unwrap();
        assert_eq!(tables, vec!["a", "b"]);
    }

    #[test]
    fn exists_subquery_is_traversed() {
        let tables = extract_source_tables(
            "SELECT * FROM orders o WHERE EXISTS (SELECT 1 FROM refunds r WHERE r.order_id = o.id)",
        )
        .unwrap();
        assert_eq!(tables, vec!["orders", "refunds"]);
    }

    #[test]
    fn result_is_order_stable_and_idempotent() {
        let sql = "SELECT * FROM b JOIN a ON a.id = b.a_id";
        let first = extract_source_tables(sql).unwrap();
        let second = extract_source_tables(sql).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "b"]);
    }

    #[test]
    fn bad_query_fails() {
        let err = extract_source_tables("SELEC * FORM sales").unwrap_err();
        assert!(matches!(err, DtError::BadQuery(_)));
    }

    #[test]
    fn non_select_statement_is_bad_query() {
        let err = extract_source_tables("DELETE FROM sales").unwrap_err();
        assert!(matches!(err, DtError::BadQuery(_)));
    }
}

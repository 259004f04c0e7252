//! The query-engine collaborator (`spec.md` §6).
//!
//! `Engine` is the abstract contract for the analytical store that actually
//! holds dynamic tables' data: time-travel reads, change-data queries,
//! transactions, and schema-only materialization. The refresh engine never
//! talks to a concrete backend directly — only through this trait — so the
//! executor and planner are fully testable against [`memory::InMemoryEngine`]
//! without a running database.

use crate::error::DtError;
use crate::types::{KeyTuple, SnapshotId};

/// Capabilities the batch executor requires of the analytical data store.
///
/// Implementations are not assumed `Sync`: a batch owns its engine
/// connection exclusively for the duration of the refresh (`spec.md` §5).
pub trait Engine: Send {
    /// The newest snapshot id in the engine's catalog, or `None` if the
    /// engine has never taken one (fresh/empty store).
    fn latest_snapshot(&mut self) -> Result<Option<SnapshotId>, DtError>;

    /// Whether a physical table by this qualified name already exists.
    fn table_exists(&mut self, schema: &str, name: &str) -> Result<bool, DtError>;

    /// Schema-only materialization: `CREATE TABLE name AS SELECT * FROM
    /// (query_sql) LIMIT 0`. Run outside any open transaction (§5).
    fn create_materialized(
        &mut self,
        schema: &str,
        name: &str,
        query_sql: &str,
    ) -> Result<(), DtError>;

    fn begin(&mut self) -> Result<(), DtError>;
    fn commit(&mut self) -> Result<(), DtError>;
    fn rollback(&mut self) -> Result<(), DtError>;

    /// Execute a DML statement (`DELETE`, `INSERT`, ...) inside the open
    /// transaction; returns the number of rows affected where the engine
    /// reports one (0 for statements without a natural row count).
    fn execute(&mut self, sql: &str) -> Result<u64, DtError>;

    fn row_count(&mut self, schema: &str, name: &str) -> Result<u64, DtError>;

    /// Rows of `table` whose `key_columns` changed between `from` and `to`
    /// (exclusive/inclusive boundary semantics are engine-defined; only the
    /// distinct key tuples are used by the incremental path).
    fn table_changes(
        &mut self,
        table: &str,
        from: SnapshotId,
        to: SnapshotId,
        key_columns: &[String],
    ) -> Result<Vec<KeyTuple>, DtError>;
}

pub mod memory {
    //! An in-process `Engine` double backed by plain Rust tables, used by
    //! the crate's own tests and as a reference implementation.
    //!
    //! Every table keeps its full history of versions rather than just its
    //! current contents, so that a rewritten query's `AT (VERSION => v)`
    //! pins actually resolve against the data as it stood at `v` — this is
    //! what lets the inheritance-rule and conflict-expansion scenarios
    //! (`spec.md` §8) be asserted against concrete row values rather than
    //! taken on faith.

    use std::collections::HashMap;

    use regex::Regex;
    use sqlparser::ast::{
        BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
        GroupByExpr, Join, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
        Statement, TableFactor, TableWithJoins, Value,
    };
    use tracing::debug;

    use super::Engine;
    use crate::error::DtError;
    use crate::extractor::parse_single_statement;
    use crate::types::{KeyTuple, SnapshotId};

    pub type Row = HashMap<String, String>;

    /// One row-changing event recorded against a base table, used to
    /// answer `table_changes`. `version` is the snapshot at which the
    /// change became visible.
    #[derive(Debug, Clone)]
    struct ChangeEvent {
        version: SnapshotId,
        key: KeyTuple,
    }

    #[derive(Debug, Clone)]
    struct TableHistory {
        /// `(version, rows as of that version)`, ascending by version.
        snapshots: Vec<(SnapshotId, Vec<Row>)>,
    }

    impl TableHistory {
        fn rows_at(&self, version: SnapshotId) -> Vec<Row> {
            self.snapshots
                .iter()
                .rev()
                .find(|(v, _)| *v <= version)
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default()
        }

        fn latest(&self) -> Vec<Row> {
            self.snapshots.last().map(|(_, rows)| rows.clone()).unwrap_or_default()
        }

        fn push(&mut self, version: SnapshotId, rows: Vec<Row>) {
            self.snapshots.push((version, rows));
        }
    }

    /// A minimal in-memory analytical store. This engine exists to drive
    /// the refresh protocol under test, not to be a general-purpose query
    /// executor: its `evaluate` method understands a single `FROM`, at
    /// most one `JOIN` (equi-join or cross join), a simple `WHERE`, and a
    /// `GROUP BY` with `SUM`/`COUNT` aggregates — exactly the query shapes
    /// this crate's own tests register.
    #[derive(Debug, Default)]
    pub struct InMemoryEngine {
        tables: HashMap<String, TableHistory>,
        changes: HashMap<String, Vec<ChangeEvent>>,
        snapshot: SnapshotId,
        in_txn: bool,
        /// Staged DML, applied atomically on `commit`, discarded on
        /// `rollback` — the in-memory equivalent of an engine transaction.
        pending: Vec<PendingOp>,
    }

    #[derive(Debug, Clone)]
    enum PendingOp {
        Delete {
            table: String,
        },
        DeleteWhere {
            table: String,
            key_columns: Vec<String>,
            keys: Vec<KeyTuple>,
        },
        Insert {
            table: String,
            rows: Vec<Row>,
        },
    }

    impl InMemoryEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed or replace a base table's full contents as a new version.
        /// Used by tests to model an upstream mutation between refreshes.
        pub fn seed_table(&mut self, name: &str, rows: Vec<Row>) {
            self.snapshot += 1;
            self.tables
                .entry(name.to_string())
                .or_insert_with(|| TableHistory { snapshots: Vec::new() })
                .push(self.snapshot, rows);
        }

        /// Record that `table`'s row with the given key changed at the
        /// current snapshot (call after `seed_table` for the same
        /// version); used by tests exercising the incremental path.
        pub fn record_change(&mut self, table: &str, key: KeyTuple) {
            self.changes
                .entry(table.to_string())
                .or_default()
                .push(ChangeEvent {
                    version: self.snapshot,
                    key,
                });
        }

        pub fn rows(&self, name: &str) -> Vec<Row> {
            self.tables.get(name).map(|h| h.latest()).unwrap_or_default()
        }

        fn rows_at(&self, name: &str, version: SnapshotId) -> Vec<Row> {
            self.tables
                .get(name)
                .map(|h| h.rows_at(version))
                .unwrap_or_default()
        }

        fn latest_rows_mut_base(&self, name: &str) -> Vec<Row> {
            self.rows(name)
        }

        /// Evaluate `query_sql` — which may carry `AT (VERSION => v)` pins
        /// emitted by [`crate::rewriter`] — against the table histories.
        pub fn evaluate(&self, query_sql: &str) -> Result<Vec<Row>, DtError> {
            let (cleaned, pins) = strip_version_pins(query_sql);
            let statement = parse_single_statement(&cleaned)?;
            let query = crate::extractor::as_query(&statement)?;
            let mut cursor = pins.into_iter();
            eval_query(query, self, &mut cursor)
        }

        fn require_txn(&self) -> Result<(), DtError> {
            if !self.in_txn {
                return Err(DtError::Internal("no open engine transaction".into()));
            }
            Ok(())
        }
    }

    impl Engine for InMemoryEngine {
        fn latest_snapshot(&mut self) -> Result<Option<SnapshotId>, DtError> {
            if self.snapshot == 0 {
                Ok(None)
            } else {
                Ok(Some(self.snapshot))
            }
        }

        fn table_exists(&mut self, _schema: &str, name: &str) -> Result<bool, DtError> {
            Ok(self.tables.contains_key(name))
        }

        fn create_materialized(
            &mut self,
            _schema: &str,
            name: &str,
            _query_sql: &str,
        ) -> Result<(), DtError> {
            debug!(table = name, "creating schema-only materialization");
            self.snapshot += 1;
            self.tables
                .entry(name.to_string())
                .or_insert_with(|| TableHistory { snapshots: Vec::new() })
                .push(self.snapshot, Vec::new());
            Ok(())
        }

        fn begin(&mut self) -> Result<(), DtError> {
            if self.in_txn {
                return Err(DtError::Internal("engine transaction already open".into()));
            }
            self.in_txn = true;
            self.pending.clear();
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DtError> {
            self.require_txn()?;
            let mut working: HashMap<String, Vec<Row>> = HashMap::new();
            for op in self.pending.drain(..) {
                match op {
                    PendingOp::Delete { table } => {
                        working.insert(table, Vec::new());
                    }
                    PendingOp::DeleteWhere {
                        table,
                        key_columns,
                        keys,
                    } => {
                        let base = working
                            .remove(&table)
                            .unwrap_or_else(|| self.latest_rows_mut_base(&table));
                        let filtered = base
                            .into_iter()
                            .filter(|row| !row_key_matches(row, &key_columns, &keys))
                            .collect();
                        working.insert(table, filtered);
                    }
                    PendingOp::Insert { table, rows } => {
                        let mut base = working
                            .remove(&table)
                            .unwrap_or_else(|| self.latest_rows_mut_base(&table));
                        base.extend(rows);
                        working.insert(table, base);
                    }
                }
            }
            self.snapshot += 1;
            for (table, rows) in working {
                self.tables
                    .entry(table)
                    .or_insert_with(|| TableHistory { snapshots: Vec::new() })
                    .push(self.snapshot, rows);
            }
            self.in_txn = false;
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), DtError> {
            self.require_txn()?;
            self.pending.clear();
            self.in_txn = false;
            Ok(())
        }

        fn execute(&mut self, sql: &str) -> Result<u64, DtError> {
            self.require_txn()?;
            let trimmed = sql.trim();
            if let Some(rest) = trimmed.strip_prefix("DELETE FROM ") {
                if let Some((table_part, where_part)) = rest.split_once(" WHERE ") {
                    let table = table_part.trim().to_string();
                    let (column, keys) = parse_in_list(where_part)?;
                    let matched = self
                        .rows(&table)
                        .iter()
                        .filter(|row| row.get(&column).is_some_and(|v| keys.contains(v)))
                        .count();
                    self.pending.push(PendingOp::DeleteWhere {
                        table,
                        key_columns: vec![column],
                        keys: keys.into_iter().map(|k| vec![k]).collect(),
                    });
                    return Ok(matched as u64);
                }
                let table = rest.trim().to_string();
                let before = self.rows(&table).len();
                self.pending.push(PendingOp::Delete { table });
                return Ok(before as u64);
            }
            if let Some(rest) = trimmed.strip_prefix("INSERT INTO ") {
                let (table, query) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| DtError::EngineError {
                        stage: "execute".into(),
                        cause: format!("malformed INSERT: {sql}"),
                    })?;
                let rows = self.evaluate(query.trim())?;
                let n = rows.len() as u64;
                self.pending.push(PendingOp::Insert {
                    table: table.to_string(),
                    rows,
                });
                return Ok(n);
            }
            Err(DtError::EngineError {
                stage: "execute".into(),
                cause: format!("unsupported statement: {sql}"),
            })
        }

        fn row_count(&mut self, _schema: &str, name: &str) -> Result<u64, DtError> {
            let committed = self.rows(name).len() as i64;
            let pending_delta: i64 = self
                .pending
                .iter()
                .map(|op| match op {
                    PendingOp::Delete { table } if table == name => -(self.rows(table).len() as i64),
                    PendingOp::DeleteWhere {
                        table,
                        key_columns,
                        keys,
                    } if table == name => {
                        let matched = self
                            .rows(table)
                            .iter()
                            .filter(|row| row_key_matches(row, key_columns, keys))
                            .count();
                        -(matched as i64)
                    }
                    PendingOp::Insert { table, rows } if table == name => rows.len() as i64,
                    _ => 0,
                })
                .sum();
            Ok((committed + pending_delta).max(0) as u64)
        }

        fn table_changes(
            &mut self,
            table: &str,
            from: SnapshotId,
            to: SnapshotId,
            _key_columns: &[String],
        ) -> Result<Vec<KeyTuple>, DtError> {
            let mut keys: Vec<KeyTuple> = self
                .changes
                .get(table)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| e.version > from && e.version <= to)
                        .map(|e| e.key.clone())
                        .collect()
                })
                .unwrap_or_default();
            keys.sort();
            keys.dedup();
            Ok(keys)
        }
    }

    fn row_key_matches(row: &Row, key_columns: &[String], keys: &[KeyTuple]) -> bool {
        let row_key: KeyTuple = key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or_default())
            .collect();
        keys.contains(&row_key)
    }

    /// Parse the one WHERE shape this engine's `execute` accepts:
    /// `col IN ('a', 'b', ...)`, as emitted by the incremental refresh
    /// path (`spec.md` §4.8 step 4) for a single-column key.
    fn parse_in_list(predicate: &str) -> Result<(String, Vec<String>), DtError> {
        let (column, rest) = predicate.split_once(" IN (").ok_or_else(|| DtError::EngineError {
            stage: "execute".into(),
            cause: format!("unsupported WHERE clause: {predicate}"),
        })?;
        let list = rest.trim().strip_suffix(')').ok_or_else(|| DtError::EngineError {
            stage: "execute".into(),
            cause: format!("malformed IN list: {predicate}"),
        })?;
        let keys = list
            .split(',')
            .map(|v| v.trim().trim_matches('\'').to_string())
            .filter(|v| !v.is_empty())
            .collect();
        Ok((column.trim().to_string(), keys))
    }

    /// Strip every `AT (VERSION => n)` clause the rewriter emits (not a
    /// construct `sqlparser`'s generic dialect understands) and return the
    /// now-parseable SQL plus the pinned versions in left-to-right
    /// occurrence order — the same order the rewriter visits table
    /// factors in, so zipping them back up against the parsed table
    /// references is exact as long as the query is re-walked in the same
    /// left-to-right order (see [`eval_table_factor`]).
    fn strip_version_pins(sql: &str) -> (String, Vec<SnapshotId>) {
        let re = Regex::new(r"\s*AT\s*\(\s*VERSION\s*=>\s*(-?\d+)\s*\)").expect("valid regex");
        let mut versions = Vec::new();
        let cleaned = re
            .replace_all(sql, |caps: &regex::Captures| {
                versions.push(caps[1].parse::<SnapshotId>().expect("captured digits"));
                ""
            })
            .into_owned();
        (cleaned, versions)
    }

    fn eval_query(
        query: &Query,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        if query.with.is_some() {
            return Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: "in-memory engine does not support WITH".into(),
            });
        }
        eval_set_expr(&query.body, engine, pins)
    }

    fn eval_set_expr(
        body: &SetExpr,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        match body {
            SetExpr::Select(select) => eval_select(select, engine, pins),
            other => Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: format!("unsupported query shape: {other}"),
            }),
        }
    }

    fn eval_select(
        select: &Select,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        if select.from.len() != 1 {
            return Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: "expected exactly one FROM item".into(),
            });
        }
        let mut rows = eval_table_with_joins(&select.from[0], engine, pins)?;

        if let Some(selection) = &select.selection {
            rows.retain(|row| eval_predicate(selection, row));
        }

        let group_cols: Vec<String> = match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => {
                exprs.iter().filter_map(expr_column_name).collect()
            }
            GroupByExpr::All(_) => Vec::new(),
        };

        if group_cols.is_empty() && !has_aggregate(&select.projection) {
            return Ok(rows
                .iter()
                .map(|row| project_row(&select.projection, row, None))
                .collect::<Result<Vec<_>, _>>()?);
        }

        let mut groups: Vec<(Vec<String>, Vec<Row>)> = Vec::new();
        for row in rows {
            let key: Vec<String> = group_cols
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or_default())
                .collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.push(row),
                None => groups.push((key, vec![row])),
            }
        }

        groups
            .iter()
            .map(|(_, bucket)| {
                let representative = bucket.first().cloned().unwrap_or_default();
                project_row(&select.projection, &representative, Some(bucket))
            })
            .collect()
    }

    fn eval_table_with_joins(
        twj: &TableWithJoins,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        let mut rows = eval_table_factor(&twj.relation, engine, pins)?;
        for join in &twj.joins {
            rows = eval_join(&rows, join, engine, pins)?;
        }
        Ok(rows)
    }

    fn eval_table_factor(
        tf: &TableFactor,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        match tf {
            TableFactor::Table { name, alias, .. } => {
                let table_name = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                if !engine.tables.contains_key(&table_name) {
                    return Err(DtError::EngineError {
                        stage: "evaluate".into(),
                        cause: format!("table not found: {table_name}"),
                    });
                }
                let version = pins.next().unwrap_or_else(|| engine.snapshot);
                let raw = engine.rows_at(&table_name, version);
                let alias_name = alias.as_ref().map(|a| a.name.value.clone());
                Ok(raw
                    .into_iter()
                    .map(|row| qualify_row(row, &table_name, alias_name.as_deref()))
                    .collect())
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let rows = eval_query(subquery, engine, pins)?;
                let alias_name = alias.as_ref().map(|a| a.name.value.clone());
                Ok(match alias_name {
                    Some(name) => rows
                        .into_iter()
                        .map(|row| qualify_row(row, &name, None))
                        .collect(),
                    None => rows,
                })
            }
            other => Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: format!("unsupported table factor: {other}"),
            }),
        }
    }

    fn eval_join(
        left: &[Row],
        join: &Join,
        engine: &InMemoryEngine,
        pins: &mut std::vec::IntoIter<SnapshotId>,
    ) -> Result<Vec<Row>, DtError> {
        let right = eval_table_factor(&join.relation, engine, pins)?;
        match &join.join_operator {
            JoinOperator::CrossJoin => Ok(cartesian(left, &right)),
            JoinOperator::Inner(JoinConstraint::On(expr)) => {
                let (lkey, rkey) = equi_join_columns(expr)?;
                let mut out = Vec::new();
                for l in left {
                    for r in &right {
                        if l.get(&lkey) == r.get(&rkey) || l.get(&lkey) == r.get(&rkey.replacen(
                            &format!("{}.", table_prefix(&rkey)),
                            "",
                            1,
                        )) {
                            out.push(merge_rows(l, r));
                        }
                    }
                }
                Ok(out)
            }
            JoinOperator::Inner(JoinConstraint::None) => Ok(cartesian(left, &right)),
            other => Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: format!("unsupported join type: {other:?}"),
            }),
        }
    }

    fn table_prefix(qualified: &str) -> String {
        qualified.split('.').next().unwrap_or_default().to_string()
    }

    fn cartesian(left: &[Row], right: &[Row]) -> Vec<Row> {
        let mut out = Vec::with_capacity(left.len() * right.len());
        for l in left {
            for r in right {
                out.push(merge_rows(l, r));
            }
        }
        out
    }

    fn merge_rows(a: &Row, b: &Row) -> Row {
        let mut out = a.clone();
        for (k, v) in b {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
        out
    }

    fn qualify_row(row: Row, table_name: &str, alias: Option<&str>) -> Row {
        let prefix = alias.unwrap_or(table_name);
        let mut out = Row::new();
        for (col, val) in row {
            out.insert(format!("{prefix}.{col}"), val.clone());
            out.entry(col).or_insert(val);
        }
        out
    }

    fn equi_join_columns(expr: &Expr) -> Result<(String, String), DtError> {
        if let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = expr
        {
            let l = expr_column_name(left).ok_or_else(|| DtError::EngineError {
                stage: "evaluate".into(),
                cause: "join predicate must compare two columns".into(),
            })?;
            let r = expr_column_name(right).ok_or_else(|| DtError::EngineError {
                stage: "evaluate".into(),
                cause: "join predicate must compare two columns".into(),
            })?;
            return Ok((l, r));
        }
        Err(DtError::EngineError {
            stage: "evaluate".into(),
            cause: "only simple equi-join predicates are supported".into(),
        })
    }

    fn expr_column_name(expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(id) => Some(id.value.clone()),
            Expr::CompoundIdentifier(parts) => {
                Some(parts.iter().map(|p| p.value.clone()).collect::<Vec<_>>().join("."))
            }
            _ => None,
        }
    }

    fn bare_column_name(expr: &Expr) -> Option<String> {
        expr_column_name(expr).map(|n| n.rsplit('.').next().unwrap_or(&n).to_string())
    }

    fn eval_predicate(expr: &Expr, row: &Row) -> bool {
        match expr {
            Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
                eval_predicate(left, row) && eval_predicate(right, row)
            }
            Expr::BinaryOp { left, op: BinaryOperator::Or, right } => {
                eval_predicate(left, row) || eval_predicate(right, row)
            }
            Expr::BinaryOp { left, op, right } => {
                let lv = resolve_value(left, row);
                let rv = resolve_value(right, row);
                compare(lv.as_deref(), rv.as_deref(), op)
            }
            Expr::InList { expr, list, negated } => {
                let v = resolve_value(expr, row);
                let found = list.iter().any(|item| resolve_value(item, row) == v);
                found != *negated
            }
            Expr::Nested(inner) => eval_predicate(inner, row),
            _ => true,
        }
    }

    fn resolve_value(expr: &Expr, row: &Row) -> Option<String> {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                let name = expr_column_name(expr)?;
                row.get(&name).cloned().or_else(|| {
                    let bare = name.rsplit('.').next().unwrap_or(&name);
                    row.get(bare).cloned()
                })
            }
            Expr::Value(Value::Number(n, _)) => Some(n.clone()),
            Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn compare(l: Option<&str>, r: Option<&str>, op: &BinaryOperator) -> bool {
        let (l, r) = match (l, r) {
            (Some(l), Some(r)) => (l, r),
            _ => return false,
        };
        if let (Ok(lf), Ok(rf)) = (l.parse::<f64>(), r.parse::<f64>()) {
            return match op {
                BinaryOperator::Eq => lf == rf,
                BinaryOperator::NotEq => lf != rf,
                BinaryOperator::Gt => lf > rf,
                BinaryOperator::GtEq => lf >= rf,
                BinaryOperator::Lt => lf < rf,
                BinaryOperator::LtEq => lf <= rf,
                _ => false,
            };
        }
        match op {
            BinaryOperator::Eq => l == r,
            BinaryOperator::NotEq => l != r,
            _ => false,
        }
    }

    fn has_aggregate(projection: &[SelectItem]) -> bool {
        projection.iter().any(|item| match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                matches!(e, Expr::Function(_))
            }
            _ => false,
        })
    }

    fn project_row(
        projection: &[SelectItem],
        representative: &Row,
        bucket: Option<&[Row]>,
    ) -> Result<Row, DtError> {
        let mut out = Row::new();
        for item in projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    let (name, value) = eval_projection_expr(expr, representative, bucket, None)?;
                    out.insert(name, value);
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let (_, value) =
                        eval_projection_expr(expr, representative, bucket, Some(&alias.value))?;
                    out.insert(alias.value.clone(), value);
                }
                other => {
                    return Err(DtError::EngineError {
                        stage: "evaluate".into(),
                        cause: format!("unsupported projection item: {other}"),
                    })
                }
            }
        }
        Ok(out)
    }

    fn eval_projection_expr(
        expr: &Expr,
        representative: &Row,
        bucket: Option<&[Row]>,
        alias: Option<&str>,
    ) -> Result<(String, String), DtError> {
        match expr {
            Expr::Function(func) => {
                let value = eval_aggregate(func, bucket.unwrap_or(std::slice::from_ref(representative)))?;
                let name = alias
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| default_function_alias(func));
                Ok((name, value))
            }
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                let name = bare_column_name(expr).ok_or_else(|| DtError::EngineError {
                    stage: "evaluate".into(),
                    cause: "expected a column reference".into(),
                })?;
                let value = resolve_value(expr, representative).unwrap_or_default();
                Ok((alias.map(|a| a.to_string()).unwrap_or(name), value))
            }
            other => Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: format!("unsupported projection expression: {other}"),
            }),
        }
    }

    fn default_function_alias(func: &Function) -> String {
        let fn_name = func.name.to_string().to_lowercase();
        let arg_name = first_function_arg(func)
            .and_then(|e| bare_column_name(&e))
            .unwrap_or_default();
        if arg_name.is_empty() {
            fn_name
        } else {
            format!("{fn_name}_{arg_name}")
        }
    }

    fn first_function_arg(func: &Function) -> Option<Expr> {
        if let FunctionArguments::List(list) = &func.args {
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => return Some(e.clone()),
                    FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } => return Some(e.clone()),
                    _ => {}
                }
            }
        }
        None
    }

    fn eval_aggregate(func: &Function, bucket: &[Row]) -> Result<String, DtError> {
        let fn_name = func.name.to_string().to_uppercase();
        match fn_name.as_str() {
            "COUNT" => Ok(bucket.len().to_string()),
            "SUM" => {
                let arg = first_function_arg(func).ok_or_else(|| DtError::EngineError {
                    stage: "evaluate".into(),
                    cause: "SUM requires one argument".into(),
                })?;
                let col = bare_column_name(&arg).ok_or_else(|| DtError::EngineError {
                    stage: "evaluate".into(),
                    cause: "SUM argument must be a column".into(),
                })?;
                let total: f64 = bucket
                    .iter()
                    .filter_map(|row| row.get(&col).and_then(|v| v.parse::<f64>().ok()))
                    .sum();
                Ok(format_number(total))
            }
            other => Err(DtError::EngineError {
                stage: "evaluate".into(),
                cause: format!("unsupported aggregate function: {other}"),
            }),
        }
    }

    fn format_number(n: f64) -> String {
        if n.fract() == 0.0 {
            format!("{}", n as i64)
        } else {
            n.to_string()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn row(pairs: &[(&str, &str)]) -> Row {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        }

        #[test]
        fn simple_group_by_sum() {
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

            let result = engine
                .evaluate(
                    "SELECT product_id, SUM(amount) AS total FROM sales AT (VERSION => 1) GROUP BY product_id",
                )
                .unwrap();
            assert_eq!(result.len(), 2);
            let by_product: HashMap<_, _> = result
                .into_iter()
                .map(|r| (r["product_id"].clone(), r["total"].clone()))
                .collect();
            assert_eq!(by_product["1"], "250");
            assert_eq!(by_product["2"], "450");
        }

        #[test]
        fn where_filter_on_plain_select() {
            let mut engine = InMemoryEngine::new();
            engine.seed_table(
                "sales_by_product",
                vec![
                    row(&[("product_id", "1"), ("total", "250")]),
                    row(&[("product_id", "2"), ("total", "450")]),
                    row(&[("product_id", "3"), ("total", "100")]),
                ],
            );
            let result = engine
                .evaluate("SELECT product_id, total FROM sales_by_product AT (VERSION => 1) WHERE total > 200")
                .unwrap();
            assert_eq!(result.len(), 2);
        }

        #[test]
        fn versioned_read_sees_historical_state() {
            let mut engine = InMemoryEngine::new();
            engine.seed_table("orders", vec![row(&[("id", "1"), ("amount", "100")])]);
            let v1 = engine.latest_snapshot().unwrap().unwrap();
            engine.seed_table(
                "orders",
                vec![
                    row(&[("id", "1"), ("amount", "100")]),
                    row(&[("id", "2"), ("amount", "200")]),
                ],
            );

            let at_v1 = engine
                .evaluate(&format!("SELECT id FROM orders AT (VERSION => {v1})"))
                .unwrap();
            assert_eq!(at_v1.len(), 1);

            let latest = engine.evaluate("SELECT id FROM orders AT (VERSION => 999)").unwrap();
            assert_eq!(latest.len(), 2);
        }
    }
}

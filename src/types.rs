//! Shared data model (`spec.md` §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An opaque, monotonically non-decreasing snapshot/version identifier.
pub type SnapshotId = i64;

/// A row key tuple as returned by `Engine::table_changes`, one value per
/// key column in the order the view's `group_by_columns` names them.
pub type KeyTuple = Vec<String>;

/// A refresh history row's primary key.
pub type HistoryId = i64;

/// Per-source version map: source table identifier -> pinned version.
pub type SnapshotPinMap = BTreeMap<String, SnapshotId>;

/// A registered dynamic table definition (`spec.md` §3 `DynamicTable`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DynamicTableDef {
    pub name: String,
    pub schema_name: String,
    pub query_sql: String,
    /// Extracted, sorted, deduplicated source-table identifiers (§4.1).
    pub source_tables: Vec<String>,
    /// Group-by key columns, required for `AFFECTED_KEYS` eligibility
    /// (§4.8). Absent for views with no simple grouping shape.
    pub group_by_columns: Option<Vec<String>>,
    /// Per-view override of `EngineConfig::cardinality_threshold`.
    pub cardinality_threshold: Option<f64>,
}

impl DynamicTableDef {
    /// The engine-qualified table name: bare when `schema_name` is `"main"`,
    /// schema-qualified otherwise — the original implementation's rule,
    /// kept in the rewriter/executor's table-naming helper.
    pub fn qualified_name(&self) -> String {
        if self.schema_name == "main" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema_name, self.name)
        }
    }
}

/// Refresh strategy actually used for one view's refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Full,
    AffectedKeys,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Full => write!(f, "FULL"),
            Strategy::AffectedKeys => write!(f, "AFFECTED_KEYS"),
        }
    }
}

/// Terminal or in-flight status of a refresh history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshStatus::Running => write!(f, "RUNNING"),
            RefreshStatus::Success => write!(f, "SUCCESS"),
            RefreshStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome recorded against a refresh history row at `record_history_end`.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub rows_affected: Option<u64>,
    pub affected_keys_count: Option<u64>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

/// One append-only refresh-history log entry (`spec.md` §3 `RefreshHistory`).
#[derive(Debug, Clone)]
pub struct RefreshHistoryEntry {
    pub id: HistoryId,
    pub dynamic_table: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: RefreshStatus,
    pub strategy_used: Option<Strategy>,
    pub rows_affected: Option<u64>,
    pub affected_keys_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub source_snapshots: SnapshotPinMap,
}

/// Result of refreshing a single view, returned to a caller of `refresh()`.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub name: String,
    pub status: RefreshStatus,
    pub rows_affected: Option<u64>,
    pub duration_ms: u64,
    pub strategy_used: Strategy,
}

/// A view summary as returned by `list()`.
#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub schema_name: String,
    pub source_tables: Vec<String>,
}

impl From<&DynamicTableDef> for View {
    fn from(def: &DynamicTableDef) -> Self {
        View {
            name: def.name.clone(),
            schema_name: def.schema_name.clone(),
            source_tables: def.source_tables.clone(),
        }
    }
}

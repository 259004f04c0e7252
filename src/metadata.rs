//! The metadata store collaborator (`spec.md` §4.3, §6).
//!
//! `MetadataStore` owns everything about a dynamic table that is not the
//! data itself: its definition, its place in the dependency graph, its
//! per-source version pins, and its refresh history. The refresh engine
//! talks to it only through this trait, exactly as it talks to the
//! analytical store only through [`crate::engine::Engine`].

use crate::error::DtError;
use crate::graph::DependencyGraph;
use crate::types::{DynamicTableDef, HistoryId, RefreshOutcome, SnapshotPinMap, Strategy};

/// Gateway to the catalog of registered dynamic tables and their refresh
/// bookkeeping. Implementations are responsible for their own internal
/// synchronization — per-view atomicity, not crate-wide locking (`spec.md`
/// §5).
pub trait MetadataStore {
    fn register(&self, def: DynamicTableDef) -> Result<(), DtError>;
    fn unregister(&self, name: &str) -> Result<(), DtError>;
    fn get(&self, name: &str) -> Result<DynamicTableDef, DtError>;
    /// All registered definitions, ordered by name.
    fn list(&self) -> Result<Vec<DynamicTableDef>, DtError>;
    /// Rebuild the dependency graph from every registered definition's
    /// extracted source tables.
    fn load_graph(&self) -> Result<DependencyGraph, DtError>;
    fn upsert_pins(&self, view: &str, pins: &SnapshotPinMap) -> Result<(), DtError>;
    fn read_pins(&self, view: &str) -> Result<SnapshotPinMap, DtError>;
    fn record_history_start(
        &self,
        view: &str,
        strategy: Strategy,
        pins: &SnapshotPinMap,
    ) -> Result<HistoryId, DtError>;
    fn record_history_end(&self, id: HistoryId, outcome: &RefreshOutcome) -> Result<(), DtError>;
}

pub mod memory {
    //! A `Mutex`-guarded in-process `MetadataStore`, used by default in
    //! tests and as a reference implementation.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::MetadataStore;
    use crate::error::DtError;
    use crate::graph::DependencyGraph;
    use crate::types::{
        DynamicTableDef, HistoryId, RefreshHistoryEntry, RefreshOutcome, SnapshotPinMap, Strategy,
    };

    #[derive(Debug, Default)]
    struct State {
        tables: HashMap<String, DynamicTableDef>,
        pins: HashMap<String, SnapshotPinMap>,
        history: Vec<RefreshHistoryEntry>,
        next_history_id: HistoryId,
    }

    /// In-memory reference implementation of [`MetadataStore`]. Every
    /// method takes `&self`; interior mutability is a single `Mutex`, one
    /// per store instance (mirrors `spec.md` §5's "per-view atomicity",
    /// coarsened to whole-store since there is no per-row lock to take in
    /// memory — fine for tests, which never run two batches concurrently
    /// against the same store).
    #[derive(Debug, Default)]
    pub struct InMemoryMetadataStore {
        state: Mutex<State>,
    }

    impl InMemoryMetadataStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl MetadataStore for InMemoryMetadataStore {
        fn register(&self, def: DynamicTableDef) -> Result<(), DtError> {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.tables.contains_key(&def.name) {
                return Err(DtError::AlreadyExists(def.name.clone()));
            }
            state.tables.insert(def.name.clone(), def);
            Ok(())
        }

        fn unregister(&self, name: &str) -> Result<(), DtError> {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.tables.contains_key(name) {
                return Err(DtError::NotFound(name.to_string()));
            }
            state.tables.remove(name);
            state.pins.remove(name);
            Ok(())
        }

        fn get(&self, name: &str) -> Result<DynamicTableDef, DtError> {
            let state = self.state.lock().expect("lock poisoned");
            state
                .tables
                .get(name)
                .cloned()
                .ok_or_else(|| DtError::NotFound(name.to_string()))
        }

        fn list(&self) -> Result<Vec<DynamicTableDef>, DtError> {
            let state = self.state.lock().expect("lock poisoned");
            let mut defs: Vec<DynamicTableDef> = state.tables.values().cloned().collect();
            defs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(defs)
        }

        fn load_graph(&self) -> Result<DependencyGraph, DtError> {
            let state = self.state.lock().expect("lock poisoned");
            let mut defs: Vec<&DynamicTableDef> = state.tables.values().collect();
            defs.sort_by(|a, b| a.name.cmp(&b.name));

            // Registration order matters for `DependencyGraph::add`'s cycle
            // check: upstreams must already be present for an edge to
            // register in the reverse index. Dynamic-table-on-dynamic-table
            // dependencies are acyclic by I2, so topologically inserting by
            // dependency count converges in at most `len()` passes.
            let mut graph = DependencyGraph::new();
            let mut remaining: Vec<&DynamicTableDef> = defs.clone();
            while !remaining.is_empty() {
                let mut progressed = false;
                remaining.retain(|def| {
                    let ready = def
                        .source_tables
                        .iter()
                        .all(|u| graph.contains(u) || !state.tables.contains_key(u));
                    if ready {
                        graph
                            .add(&def.name, def.source_tables.clone())
                            .expect("acyclic by registration invariant");
                        progressed = true;
                        false
                    } else {
                        true
                    }
                });
                if !progressed {
                    return Err(DtError::Internal(
                        "stored dependency graph contains a cycle".into(),
                    ));
                }
            }
            Ok(graph)
        }

        fn upsert_pins(&self, view: &str, pins: &SnapshotPinMap) -> Result<(), DtError> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.pins.entry(view.to_string()).or_default().extend(pins.clone());
            Ok(())
        }

        fn read_pins(&self, view: &str) -> Result<SnapshotPinMap, DtError> {
            let state = self.state.lock().expect("lock poisoned");
            Ok(state.pins.get(view).cloned().unwrap_or_default())
        }

        fn record_history_start(
            &self,
            view: &str,
            strategy: Strategy,
            pins: &SnapshotPinMap,
        ) -> Result<HistoryId, DtError> {
            let mut state = self.state.lock().expect("lock poisoned");
            let id = state.next_history_id;
            state.next_history_id += 1;
            state.history.push(RefreshHistoryEntry {
                id,
                dynamic_table: view.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                status: crate::types::RefreshStatus::Running,
                strategy_used: Some(strategy),
                rows_affected: None,
                affected_keys_count: None,
                duration_ms: None,
                error_message: None,
                source_snapshots: pins.clone(),
            });
            Ok(id)
        }

        fn record_history_end(&self, id: HistoryId, outcome: &RefreshOutcome) -> Result<(), DtError> {
            let mut state = self.state.lock().expect("lock poisoned");
            let entry = state
                .history
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| DtError::Internal(format!("no history row with id {id}")))?;
            entry.completed_at = Some(Utc::now());
            entry.status = outcome.status;
            entry.rows_affected = outcome.rows_affected;
            entry.affected_keys_count = outcome.affected_keys_count;
            entry.duration_ms = Some(outcome.duration_ms);
            entry.error_message = outcome.error_message.clone();
            Ok(())
        }
    }

    impl InMemoryMetadataStore {
        /// The full history log, most recent last — used by tests to
        /// assert on the exact sequence of recorded runs.
        pub fn history(&self) -> Vec<RefreshHistoryEntry> {
            self.state.lock().expect("lock poisoned").history.clone()
        }
    }

}

pub mod postgres {
    //! A [`MetadataStore`] backed by a real PostgreSQL connection, using the
    //! schema from `spec.md` §6 (`original_source/metadata.py`'s
    //! `METADATA_SCHEMA`, table/column names normalized to the spec's
    //! indicative names).

    use std::sync::Mutex;

    use postgres::{Client, NoTls};
    use serde_json;

    use super::MetadataStore;
    use crate::error::DtError;
    use crate::graph::DependencyGraph;
    use crate::types::{DynamicTableDef, HistoryId, RefreshOutcome, SnapshotPinMap, Strategy};

    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dynamic_tables (
    name VARCHAR PRIMARY KEY,
    schema_name VARCHAR NOT NULL,
    query_sql TEXT NOT NULL,
    group_by_columns TEXT,
    cardinality_threshold DOUBLE PRECISION
);

CREATE TABLE IF NOT EXISTS dependencies (
    downstream VARCHAR,
    upstream VARCHAR,
    PRIMARY KEY (downstream, upstream),
    FOREIGN KEY (downstream) REFERENCES dynamic_tables(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_dependencies_downstream ON dependencies(downstream);
CREATE INDEX IF NOT EXISTS idx_dependencies_upstream ON dependencies(upstream);

CREATE TABLE IF NOT EXISTS source_snapshots (
    dynamic_table VARCHAR,
    source_table VARCHAR,
    last_snapshot BIGINT NOT NULL,
    PRIMARY KEY (dynamic_table, source_table),
    FOREIGN KEY (dynamic_table) REFERENCES dynamic_tables(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS refresh_history (
    id BIGSERIAL PRIMARY KEY,
    dynamic_table VARCHAR NOT NULL,
    started_at TIMESTAMP NOT NULL,
    completed_at TIMESTAMP,
    status VARCHAR NOT NULL,
    strategy_used VARCHAR,
    rows_affected BIGINT,
    affected_keys_count BIGINT,
    duration_ms BIGINT,
    error_message TEXT,
    source_snapshots JSONB,
    FOREIGN KEY (dynamic_table) REFERENCES dynamic_tables(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_history_table ON refresh_history(dynamic_table);
CREATE INDEX IF NOT EXISTS idx_history_started ON refresh_history(started_at);
"#;

    /// Real gateway to a PostgreSQL metadata schema. Connection handling
    /// mirrors the original's `connect()`/`_init_schema()` split: the
    /// schema is applied once, at construction.
    pub struct PostgresMetadataStore {
        client: Mutex<Client>,
    }

    impl PostgresMetadataStore {
        pub fn connect(connection_string: &str) -> Result<Self, DtError> {
            let mut client = Client::connect(connection_string, NoTls).map_err(|e| {
                DtError::MetadataError(format!("connect failed: {e}"))
            })?;
            client
                .batch_execute(SCHEMA)
                .map_err(|e| DtError::MetadataError(format!("schema init failed: {e}")))?;
            Ok(Self {
                client: Mutex::new(client),
            })
        }
    }

    impl MetadataStore for PostgresMetadataStore {
        fn register(&self, def: DynamicTableDef) -> Result<(), DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let group_by = def.group_by_columns.map(|cols| cols.join(","));
            client
                .execute(
                    "INSERT INTO dynamic_tables (name, schema_name, query_sql, group_by_columns, cardinality_threshold) VALUES ($1, $2, $3, $4, $5)",
                    &[&def.name, &def.schema_name, &def.query_sql, &group_by, &def.cardinality_threshold],
                )
                .map_err(|e| classify_insert_error(&def.name, e))?;
            for upstream in &def.source_tables {
                client
                    .execute(
                        "INSERT INTO dependencies (downstream, upstream) VALUES ($1, $2)",
                        &[&def.name, upstream],
                    )
                    .map_err(|e| DtError::MetadataError(e.to_string()))?;
            }
            Ok(())
        }

        fn unregister(&self, name: &str) -> Result<(), DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let n = client
                .execute("DELETE FROM dynamic_tables WHERE name = $1", &[&name])
                .map_err(|e| DtError::MetadataError(e.to_string()))?;
            if n == 0 {
                return Err(DtError::NotFound(name.to_string()));
            }
            Ok(())
        }

        fn get(&self, name: &str) -> Result<DynamicTableDef, DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let row = client
                .query_opt(
                    "SELECT name, schema_name, query_sql, group_by_columns, cardinality_threshold FROM dynamic_tables WHERE name = $1",
                    &[&name],
                )
                .map_err(|e| DtError::MetadataError(e.to_string()))?
                .ok_or_else(|| DtError::NotFound(name.to_string()))?;
            row_to_def(&mut client, &row)
        }

        fn list(&self) -> Result<Vec<DynamicTableDef>, DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let rows = client
                .query(
                    "SELECT name, schema_name, query_sql, group_by_columns, cardinality_threshold FROM dynamic_tables ORDER BY name",
                    &[],
                )
                .map_err(|e| DtError::MetadataError(e.to_string()))?;
            rows.iter().map(|r| row_to_def(&mut client, r)).collect()
        }

        fn load_graph(&self) -> Result<DependencyGraph, DtError> {
            let defs = self.list()?;
            let all_names: std::collections::HashSet<&str> =
                defs.iter().map(|d| d.name.as_str()).collect();
            let mut graph = DependencyGraph::new();
            let mut remaining = defs;
            while !remaining.is_empty() {
                let mut progressed = false;
                remaining.retain(|def| {
                    let ready = def
                        .source_tables
                        .iter()
                        .all(|u| graph.contains(u) || !all_names.contains(u.as_str()));
                    if ready {
                        let _ = graph.add(&def.name, def.source_tables.clone());
                        progressed = true;
                        false
                    } else {
                        true
                    }
                });
                if !progressed {
                    return Err(DtError::Internal(
                        "stored dependency graph contains a cycle".into(),
                    ));
                }
            }
            Ok(graph)
        }

        fn upsert_pins(&self, view: &str, pins: &SnapshotPinMap) -> Result<(), DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            for (source_table, last_snapshot) in pins {
                client
                    .execute(
                        "INSERT INTO source_snapshots (dynamic_table, source_table, last_snapshot) VALUES ($1, $2, $3)
                         ON CONFLICT (dynamic_table, source_table) DO UPDATE SET last_snapshot = EXCLUDED.last_snapshot",
                        &[&view, source_table, last_snapshot],
                    )
                    .map_err(|e| DtError::MetadataError(e.to_string()))?;
            }
            Ok(())
        }

        fn read_pins(&self, view: &str) -> Result<SnapshotPinMap, DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let rows = client
                .query(
                    "SELECT source_table, last_snapshot FROM source_snapshots WHERE dynamic_table = $1",
                    &[&view],
                )
                .map_err(|e| DtError::MetadataError(e.to_string()))?;
            Ok(rows
                .iter()
                .map(|row| (row.get::<_, String>(0), row.get::<_, i64>(1)))
                .collect())
        }

        fn record_history_start(
            &self,
            view: &str,
            strategy: Strategy,
            pins: &SnapshotPinMap,
        ) -> Result<HistoryId, DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            let json = serde_json::to_value(pins).map_err(|e| DtError::MetadataError(e.to_string()))?;
            let row = client
                .query_one(
                    "INSERT INTO refresh_history (dynamic_table, started_at, status, strategy_used, source_snapshots)
                     VALUES ($1, now(), 'RUNNING', $2, $3) RETURNING id",
                    &[&view, &strategy.to_string(), &json],
                )
                .map_err(|e| DtError::MetadataError(e.to_string()))?;
            Ok(row.get::<_, i64>(0))
        }

        fn record_history_end(&self, id: HistoryId, outcome: &RefreshOutcome) -> Result<(), DtError> {
            let mut client = self.client.lock().expect("lock poisoned");
            client
                .execute(
                    "UPDATE refresh_history SET completed_at = now(), status = $2, rows_affected = $3,
                     affected_keys_count = $4, duration_ms = $5, error_message = $6 WHERE id = $1",
                    &[
                        &id,
                        &outcome.status.to_string(),
                        &outcome.rows_affected.map(|n| n as i64),
                        &outcome.affected_keys_count.map(|n| n as i64),
                        &(outcome.duration_ms as i64),
                        &outcome.error_message,
                    ],
                )
                .map_err(|e| DtError::MetadataError(e.to_string()))?;
            Ok(())
        }
    }

    fn classify_insert_error(name: &str, e: postgres::Error) -> DtError {
        if e.to_string().contains("duplicate key") {
            DtError::AlreadyExists(name.to_string())
        } else {
            DtError::MetadataError(e.to_string())
        }
    }

    fn row_to_def(
        _client: &mut Client,
        row: &postgres::Row,
    ) -> Result<DynamicTableDef, DtError> {
        let name: String = row.get(0);
        let schema_name: String = row.get(1);
        let query_sql: String = row.get(2);
        let group_by_columns: Option<String> = row.get(3);
        let cardinality_threshold: Option<f64> = row.get(4);
        let source_tables =
            crate::extractor::extract_source_tables(&query_sql).unwrap_or_default();
        Ok(DynamicTableDef {
            name,
            schema_name,
            query_sql,
            source_tables,
            group_by_columns: group_by_columns.map(|s| s.split(',').map(str::to_string).collect()),
            cardinality_threshold,
        })
    }
}

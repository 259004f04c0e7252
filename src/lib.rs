//! dynamic_tables — a refresh engine for declaratively defined
//! materialized views over a versioned, snapshot-capable data store.
//!
//! A caller registers a named view over a query; the engine maintains a
//! physical table holding that query's result, refreshing it on demand in
//! a way that is consistent across the view's dependency DAG, atomic per
//! batch, and able to use either a full recomputation or an
//! affected-keys incremental strategy.
//!
//! # Theoretical basis
//!
//! - Snapshot-isolated materialized view maintenance over a lakehouse-style
//!   versioned store, in the spirit of Gupta & Mumick (1995), "Maintenance
//!   of Materialized Views: Problems, Techniques, and Applications".
//! - The conflict-expansion rule below is this crate's own answer to the
//!   classic "consistent group refresh" problem for a DAG of views sharing
//!   base tables.
//!
//! # Collaborators
//!
//! This crate owns the refresh engine only. The analytical query engine
//! ([`Engine`]) and the catalog ([`MetadataStore`]) are external
//! collaborators reached only through their trait contracts; see
//! [`engine::memory::InMemoryEngine`] and [`metadata::memory::InMemoryMetadataStore`]
//! for in-process reference implementations, and [`metadata::postgres::PostgresMetadataStore`]
//! for a real backend.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod conflict;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod graph;
pub mod incremental;
pub mod metadata;
pub mod planner;
pub mod rewriter;
pub mod types;

use tracing::instrument;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{DtError, DtErrorKind};
pub use metadata::MetadataStore;
pub use types::{DynamicTableDef, RefreshResult, RefreshStatus, Strategy, View};

/// The public facade: `register`, `drop`, `refresh`, `list`
/// (`spec.md` §6), generic over any [`Engine`]/[`MetadataStore`] pair.
pub struct DynamicTables<'a> {
    engine: &'a mut dyn Engine,
    metadata: &'a dyn MetadataStore,
    config: EngineConfig,
}

impl<'a> DynamicTables<'a> {
    pub fn new(engine: &'a mut dyn Engine, metadata: &'a dyn MetadataStore, config: EngineConfig) -> Self {
        Self {
            engine,
            metadata,
            config,
        }
    }

    /// Register a new dynamic table: extracts source tables from
    /// `query_sql`, fails with [`DtError::Cycle`] if the registration
    /// would create one, and with [`DtError::AlreadyExists`] if `name` is
    /// already registered (I1, I6).
    #[instrument(skip(self, query_sql), fields(name = %name))]
    pub fn register(
        &self,
        name: &str,
        schema_name: &str,
        query_sql: &str,
        group_by_columns: Option<Vec<String>>,
        cardinality_threshold: Option<f64>,
    ) -> Result<(), DtError> {
        if self.metadata.get(name).is_ok() {
            return Err(DtError::AlreadyExists(name.to_string()));
        }

        let source_tables = extractor::extract_source_tables(query_sql)?;

        let mut graph = self.metadata.load_graph()?;
        graph.add(name, source_tables.clone())?;

        let def = DynamicTableDef {
            name: name.to_string(),
            schema_name: schema_name.to_string(),
            query_sql: query_sql.to_string(),
            source_tables,
            group_by_columns,
            cardinality_threshold,
        };
        self.metadata.register(def)
    }

    /// Drop `name`; fails with [`DtError::HasDependents`] if any other
    /// registered view still lists it as an upstream (I6).
    #[instrument(skip(self))]
    pub fn drop(&self, name: &str) -> Result<(), DtError> {
        self.metadata.get(name)?;
        let graph = self.metadata.load_graph()?;
        let dependents = graph.dependents_of(name);
        if !dependents.is_empty() {
            return Err(DtError::HasDependents(name.to_string(), dependents));
        }
        self.metadata.unregister(name)
    }

    /// List every registered view (`spec.md` §6 `list()`).
    pub fn list(&self) -> Result<Vec<View>, DtError> {
        let defs = self.metadata.list()?;
        Ok(defs.iter().map(View::from).collect())
    }

    /// Refresh `subset` — or, when empty, every registered view — as one
    /// batch. Conflict detection widens `subset` to the fixed point
    /// (`SPEC_FULL.md` §9's resolution of the Open Question) before the
    /// graph is asked for a topological order, so the caller never has to
    /// reason about sibling-pin disagreement itself.
    #[instrument(skip(self, subset))]
    pub fn refresh(&mut self, subset: &[String]) -> Result<Vec<RefreshResult>, DtError> {
        let graph = self.metadata.load_graph()?;

        for name in subset {
            if !graph.contains(name) {
                return Err(DtError::NotFound(name.clone()));
            }
        }

        let requested: Vec<String> = if subset.is_empty() {
            graph.names().map(str::to_string).collect()
        } else {
            subset.to_vec()
        };

        let ordered = conflict::expand_to_fixed_point(&graph, self.metadata, &requested);
        executor::run_batch(&mut *self.engine, self.metadata, &graph, &self.config, &ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::memory::InMemoryEngine;
    use metadata::memory::InMemoryMetadataStore;

    #[test]
    fn register_refresh_list_drop_round_trip() {
        let mut engine = InMemoryEngine::new();
        engine.seed_table(
            "orders",
            vec![
                [("customer_id".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                [("customer_id".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                [("customer_id".to_string(), "2".to_string())]
                    .into_iter()
                    .collect(),
            ],
        );
        let metadata = InMemoryMetadataStore::new();
        let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

        dt.register(
            "orders_by_customer",
            "main",
            "SELECT customer_id, COUNT(*) AS order_count FROM orders GROUP BY customer_id",
            Some(vec!["customer_id".to_string()]),
            None,
        )
        .unwrap();

        assert_eq!(dt.list().unwrap().len(), 1);

        let results = dt.refresh(&[]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RefreshStatus::Success);
        assert_eq!(results[0].rows_affected, Some(2));

        dt.drop("orders_by_customer").unwrap();
        assert!(dt.list().unwrap().is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut engine = InMemoryEngine::new();
        let metadata = InMemoryMetadataStore::new();
        let dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

        dt.register("v", "main", "SELECT * FROM raw", None, None).unwrap();
        let err = dt.register("v", "main", "SELECT * FROM raw", None, None).unwrap_err();
        assert!(matches!(err, DtError::AlreadyExists(_)));
    }

    #[test]
    fn drop_blocked_by_dependent_view() {
        let mut engine = InMemoryEngine::new();
        let metadata = InMemoryMetadataStore::new();
        let dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

        dt.register("base_view", "main", "SELECT * FROM raw", None, None).unwrap();
        dt.register(
            "downstream_view",
            "main",
            "SELECT * FROM base_view",
            None,
            None,
        )
        .unwrap();

        let err = dt.drop("base_view").unwrap_err();
        assert!(matches!(err, DtError::HasDependents(_, _)));
    }

    #[test]
    fn refreshing_unknown_view_is_not_found() {
        let mut engine = InMemoryEngine::new();
        let metadata = InMemoryMetadataStore::new();
        let mut dt = DynamicTables::new(&mut engine, &metadata, EngineConfig::default());

        let err = dt.refresh(&["ghost".to_string()]).unwrap_err();
        assert!(matches!(err, DtError::NotFound(_)));
    }
}

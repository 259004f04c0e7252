//! The batch executor (`spec.md` §4.7) — the heart of the system.
//!
//! Given an effective refresh set in topological order, runs every view's
//! DELETE+INSERT inside one engine transaction, with snapshot pins from
//! [`crate::planner`] and, where eligible, the restricted delete/insert of
//! [`crate::incremental`]. Grounded on the original's `refresh_table`
//! exception handling, generalized across a whole batch: history rows are
//! flushed to the metadata store only after the engine transaction's
//! outcome is known (`SPEC_FULL.md` §4.7's resolution of the partial-batch
//! Open Question), via an in-memory ledger keyed by history id.

use std::time::Instant;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::DtError;
use crate::graph::DependencyGraph;
use crate::incremental;
use crate::metadata::MetadataStore;
use crate::planner::plan_pins;
use crate::rewriter::apply_pins;
use crate::types::{HistoryId, RefreshOutcome, RefreshResult, RefreshStatus, SnapshotPinMap, Strategy};

/// Run one batch: every name in `views`, already topologically ordered,
/// refreshed inside a single engine transaction.
pub fn run_batch(
    engine: &mut dyn Engine,
    metadata: &dyn MetadataStore,
    graph: &DependencyGraph,
    config: &EngineConfig,
    views: &[String],
) -> Result<Vec<RefreshResult>, DtError> {
    let batch_version = engine.latest_snapshot()?.unwrap_or(0);

    // DDL runs outside the transaction (`spec.md` §4.7 step 2): a fresh
    // view gets its schema-only materialization before any DML is
    // attempted against it.
    for view in views {
        let def = metadata.get(view)?;
        if !engine.table_exists(&def.schema_name, &def.name)? {
            engine.create_materialized(&def.schema_name, &def.name, &def.query_sql)?;
        }
    }

    engine.begin()?;

    let mut ledger: Vec<(HistoryId, RefreshOutcome)> = Vec::new();
    let mut results = Vec::new();

    for view in views {
        match refresh_one(engine, metadata, graph, config, view, batch_version, &mut ledger) {
            Ok(result) => results.push(result),
            Err(err) => {
                warn!(view = view.as_str(), error = %err, "batch aborted");
                let _ = engine.rollback();
                fail_pending(&mut ledger);
                for (id, outcome) in &ledger {
                    // Best-effort: a metadata failure here must not mask
                    // the original engine error, which is what the caller
                    // needs to act on.
                    let _ = metadata.record_history_end(*id, outcome);
                }
                return Err(err);
            }
        }
    }

    engine.commit()?;
    for (id, outcome) in &ledger {
        metadata.record_history_end(*id, outcome)?;
    }
    info!(count = results.len(), "batch committed");
    Ok(results)
}

/// Rewrite every ledger entry still carrying an in-memory `SUCCESS` to
/// `FAILED`: their data writes were just rolled back with the rest of the
/// batch, so a `SUCCESS` history row against that data would be a lie.
fn fail_pending(ledger: &mut [(HistoryId, RefreshOutcome)]) {
    for (_, outcome) in ledger.iter_mut() {
        if outcome.status == RefreshStatus::Success {
            outcome.status = RefreshStatus::Failed;
            outcome.error_message = Some("rolled back: a later view in the same batch failed".into());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn refresh_one(
    engine: &mut dyn Engine,
    metadata: &dyn MetadataStore,
    graph: &DependencyGraph,
    config: &EngineConfig,
    view: &str,
    batch_version: i64,
    ledger: &mut Vec<(HistoryId, RefreshOutcome)>,
) -> Result<RefreshResult, DtError> {
    let def = metadata.get(view)?;
    let prev_pins = metadata.read_pins(view).unwrap_or_default();
    let pins = plan_pins(
        metadata,
        &def.source_tables,
        |name| graph.contains(name),
        batch_version,
    );

    let tentative_strategy = if incremental::eligible(&def) {
        Strategy::AffectedKeys
    } else {
        config.default_strategy
    };
    let history_id = metadata.record_history_start(view, tentative_strategy, &pins)?;
    let started = Instant::now();

    let outcome = run_view(engine, &def, graph, config, &pins, &prev_pins);

    let (result, recorded) = match outcome {
        Ok((strategy_used, rows_affected, affected_keys_count)) => {
            metadata.upsert_pins(view, &pins)?;
            let duration_ms = started.elapsed().as_millis() as u64;
            let outcome = RefreshOutcome {
                status: RefreshStatus::Success,
                rows_affected: Some(rows_affected),
                affected_keys_count,
                duration_ms,
                error_message: None,
            };
            let result = RefreshResult {
                name: view.to_string(),
                status: RefreshStatus::Success,
                rows_affected: Some(rows_affected),
                duration_ms,
                strategy_used,
            };
            (Ok(result), outcome)
        }
        Err(err) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            let outcome = RefreshOutcome {
                status: RefreshStatus::Failed,
                rows_affected: None,
                affected_keys_count: None,
                duration_ms,
                error_message: Some(err.to_string()),
            };
            (Err(err), outcome)
        }
    };

    ledger.push((history_id, recorded));
    result
}

/// Run a single view's DDL/DML inside the already-open engine
/// transaction, choosing `AFFECTED_KEYS` over `FULL` per `spec.md` §4.8
/// when eligible and under threshold. Returns the strategy actually used,
/// the row count written, and the affected-key count if incremental.
fn run_view(
    engine: &mut dyn Engine,
    def: &crate::types::DynamicTableDef,
    graph: &DependencyGraph,
    config: &EngineConfig,
    pins: &SnapshotPinMap,
    prev_pins: &SnapshotPinMap,
) -> Result<(Strategy, u64, Option<u64>), DtError> {
    let qualified = def.qualified_name();
    let exists = engine.table_exists(&def.schema_name, &def.name)?;

    let pins_i64: std::collections::HashMap<String, i64> =
        pins.iter().map(|(k, v)| (k.clone(), *v)).collect();
    let rewritten = apply_pins(&def.query_sql, &pins_i64).map_err(|e| match e {
        DtError::BadQuery(msg) => DtError::RewriteFailed(msg),
        other => other,
    })?;

    let threshold = config.threshold_for(def.cardinality_threshold);
    let plan = incremental::compute_affected_keys(
        engine,
        def,
        |name| graph.contains(name),
        prev_pins,
        pins,
        &def.schema_name,
        &def.name,
        threshold,
    )?;

    if let Some(plan) = plan {
        let key_column = def
            .group_by_columns
            .as_ref()
            .and_then(|cols| cols.first())
            .expect("incremental::eligible requires at least one group-by column")
            .clone();
        let clause = incremental::in_list_clause(&key_column, &plan.keys);

        engine.execute(&format!("DELETE FROM {qualified} WHERE {clause}"))?;
        let inserted = engine.execute(&format!(
            "INSERT INTO {qualified} SELECT * FROM ({rewritten}) AS affected WHERE {clause}"
        ))?;
        let rows_affected = engine.row_count(&def.schema_name, &def.name)?;
        let _ = inserted;
        return Ok((Strategy::AffectedKeys, rows_affected, Some(plan.keys.len() as u64)));
    }

    if exists {
        engine.execute(&format!("DELETE FROM {qualified}"))?;
    }
    engine.execute(&format!("INSERT INTO {qualified} {rewritten}"))?;
    let rows_affected = engine.row_count(&def.schema_name, &def.name)?;
    Ok((Strategy::Full, rows_affected, None))
}

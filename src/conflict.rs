//! Conflict detection for subset refreshes (`spec.md` §4.6).
//!
//! A caller asking to refresh a strict subset of registered views can end
//! up with siblings whose pinned snapshots of a shared base table
//! disagree (scenario: two views both read `orders`, one is refreshed
//! while `orders` is mutated, the other isn't — now their pins for
//! `orders` differ). Before executing a subset refresh, every such
//! disagreement has to be found and the offending views folded into the
//! batch too, so invariant I5 (siblings agree on shared pins) is
//! reestablished by the refresh itself.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::DependencyGraph;
use crate::metadata::MetadataStore;

/// One pass of `spec.md`'s expansion rule: for each view in `subset`,
/// group its direct dynamic-table upstreams' stored pins by source name;
/// any source pinned to more than one distinct version pulls every
/// disagreeing upstream into the returned expansion set.
fn expand_once(
    graph: &DependencyGraph,
    metadata: &dyn MetadataStore,
    subset: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut expansion = BTreeSet::new();

    for view in subset {
        let upstreams = match graph.upstreams_of(view) {
            Some(u) => u,
            None => continue,
        };
        let dynamic_upstreams: Vec<&String> =
            upstreams.iter().filter(|u| graph.contains(u)).collect();
        if dynamic_upstreams.len() < 2 {
            continue;
        }

        // source name -> (version -> upstreams pinning it there)
        let mut by_source: BTreeMap<String, BTreeMap<i64, Vec<String>>> = BTreeMap::new();
        for upstream in &dynamic_upstreams {
            let pins = metadata.read_pins(upstream).unwrap_or_default();
            for (source, version) in pins {
                by_source
                    .entry(source)
                    .or_default()
                    .entry(version)
                    .or_default()
                    .push((*upstream).clone());
            }
        }

        for versions in by_source.values() {
            if versions.len() > 1 {
                for upstreams in versions.values() {
                    expansion.extend(upstreams.iter().cloned());
                }
            }
        }
    }

    expansion
}

/// The single-pass primitive `spec.md` §4.6 specifies: expand `subset`
/// exactly once and return the union, topologically ordered.
pub fn expand_subset(
    graph: &DependencyGraph,
    metadata: &dyn MetadataStore,
    subset: &[String],
) -> Vec<String> {
    let subset_set: BTreeSet<String> = subset.iter().cloned().collect();
    let expansion = expand_once(graph, metadata, &subset_set);
    let effective: BTreeSet<String> = subset_set.union(&expansion).cloned().collect();
    graph.topo_order_subset(&effective.into_iter().collect())
}

/// The resolved Open Question variant (`SPEC_FULL.md` §9, §4.6): iterate
/// the single pass to a fixed point, bounded by the view count, so a
/// disagreement exposed only after the first expansion is caught too.
/// This is what `refresh()` uses by default; [`expand_subset`] remains
/// available for callers who want the spec-literal single pass.
pub fn expand_to_fixed_point(
    graph: &DependencyGraph,
    metadata: &dyn MetadataStore,
    subset: &[String],
) -> Vec<String> {
    let mut effective: BTreeSet<String> = subset.iter().cloned().collect();
    let bound = graph.len().max(1);

    for _ in 0..=bound {
        let expansion = expand_once(graph, metadata, &effective);
        if expansion.is_subset(&effective) {
            break;
        }
        effective.extend(expansion);
    }

    graph.topo_order_subset(&effective.into_iter().collect())
}

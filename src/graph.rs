//! The dependency graph of registered dynamic tables (`spec.md` §4.2).
//!
//! Each node is a dynamic table, keyed by name. An edge `u -> v` means `v`
//! reads from `u` (`u` is upstream of `v`). Upstreams that are not
//! themselves registered dynamic tables (base tables in the underlying
//! store) are recorded on the node but never appear as graph nodes of their
//! own — they contribute no in-degree and are never topologically ordered.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::DtError;

/// A single dynamic table's registration: its name and the upstream names
/// its query reads from (as extracted by [`crate::extractor`]).
#[derive(Debug, Clone)]
struct Node {
    upstreams: Vec<String>,
}

/// The dependency graph of all registered dynamic tables.
///
/// Mirrors the teacher's `StDag`: adjacency is kept in both directions
/// (`edges` downstream-to-upstream via each node's own `upstreams`, and a
/// derived reverse index) so that both "what does this depend on" and
/// "what depends on this" are O(1) lookups.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    /// Reverse index: upstream name -> set of registered dynamic tables
    /// that declare it as an upstream. Only populated for edges whose
    /// downstream endpoint is itself a registered dynamic table.
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All registered dynamic table names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// The upstream names declared by `name`'s defining query, whether or
    /// not each one is itself a registered dynamic table.
    pub fn upstreams_of(&self, name: &str) -> Option<&[String]> {
        self.nodes.get(name).map(|n| n.upstreams.as_slice())
    }

    /// Registered dynamic tables that declare `name` as an upstream.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependents
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `name` with the given upstream names.
    ///
    /// Fails with [`DtError::Cycle`] if adding this node would introduce a
    /// cycle among registered dynamic tables, naming the full cycle path.
    /// The check runs against a tentative copy of the graph so that no
    /// partial state is ever visible on failure, matching the original's
    /// `DependencyGraph.add_table`.
    pub fn add(&mut self, name: &str, upstreams: Vec<String>) -> Result<(), DtError> {
        if self.nodes.contains_key(name) {
            return Err(DtError::AlreadyExists(name.to_string()));
        }

        let mut tentative = self.nodes.clone();
        tentative.insert(
            name.to_string(),
            Node {
                upstreams: upstreams.clone(),
            },
        );
        if let Some(cycle) = find_cycle_through(&tentative, name) {
            return Err(DtError::Cycle(cycle));
        }

        for upstream in &upstreams {
            if self.nodes.contains_key(upstream) {
                self.dependents
                    .entry(upstream.clone())
                    .or_default()
                    .insert(name.to_string());
            }
        }
        self.nodes.insert(name.to_string(), Node { upstreams });
        Ok(())
    }

    /// Remove `name` from the graph.
    ///
    /// Fails with [`DtError::HasDependents`] if any other registered
    /// dynamic table still lists `name` as an upstream.
    pub fn remove(&mut self, name: &str) -> Result<(), DtError> {
        if !self.nodes.contains_key(name) {
            return Err(DtError::NotFound(name.to_string()));
        }
        let dependents = self.dependents_of(name);
        if !dependents.is_empty() {
            return Err(DtError::HasDependents(name.to_string(), dependents));
        }

        let node = self.nodes.remove(name).expect("checked above");
        for upstream in &node.upstreams {
            if let Some(set) = self.dependents.get_mut(upstream) {
                set.remove(name);
            }
        }
        self.dependents.remove(name);
        Ok(())
    }

    /// Topologically order every registered dynamic table such that each
    /// name appears after all of its registered upstreams.
    ///
    /// Uses Kahn's algorithm: in-degree counts only edges whose source is
    /// itself a registered dynamic table (base-table upstreams contribute
    /// no in-degree, since they are never scheduled). Ties are broken by
    /// name for a deterministic order.
    pub fn topo_order(&self) -> Vec<String> {
        topo_order_of(&self.nodes)
    }

    /// The subset of `topo_order()` restricted to `subset`, preserving
    /// relative order. Used by the executor to order a partially expanded
    /// refresh batch.
    pub fn topo_order_subset(&self, subset: &HashSet<String>) -> Vec<String> {
        self.topo_order()
            .into_iter()
            .filter(|n| subset.contains(n))
            .collect()
    }

    /// All registered dynamic-table ancestors of `name` (its upstreams,
    /// their upstreams, and so on), not including `name` itself.
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self
            .nodes
            .get(name)
            .map(|n| n.upstreams.clone())
            .unwrap_or_default();
        while let Some(candidate) = stack.pop() {
            if self.nodes.contains_key(&candidate) && seen.insert(candidate.clone()) {
                if let Some(n) = self.nodes.get(&candidate) {
                    stack.extend(n.upstreams.clone());
                }
            }
        }
        seen
    }

    /// All registered dynamic-table descendants of `name` (views that
    /// depend on it, directly or transitively), not including `name`.
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self.dependents_of(name);
        while let Some(candidate) = stack.pop() {
            if seen.insert(candidate.clone()) {
                stack.extend(self.dependents_of(&candidate));
            }
        }
        seen
    }
}

fn topo_order_of(nodes: &HashMap<String, Node>) -> Vec<String> {
    // in_degree[v] = number of v's upstreams that are themselves registered
    // dynamic tables.
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (name, node) in nodes {
        let count = node
            .upstreams
            .iter()
            .filter(|u| nodes.contains_key(u.as_str()))
            .count();
        in_degree.insert(name.as_str(), count);
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut queue: VecDeque<&str> = ready.iter().copied().collect();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut remaining_in_degree = in_degree.clone();

    while let Some(name) = pop_smallest(&mut queue, &mut ready) {
        ordered.push(name.to_string());
        for (candidate, node) in nodes {
            if node.upstreams.iter().any(|u| u == name) {
                if let Some(deg) = remaining_in_degree.get_mut(candidate.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(candidate.as_str());
                        queue.push_back(candidate.as_str());
                    }
                }
            }
        }
    }
    ordered
}

/// Pop the lexicographically smallest ready name, keeping `queue` and
/// `ready` consistent. Deterministic tie-breaking matches the teacher's
/// `topological_sort_inner`, which sorts each ready batch by name.
fn pop_smallest<'a>(queue: &mut VecDeque<&'a str>, ready: &mut BTreeSet<&'a str>) -> Option<&'a str> {
    let name = *ready.iter().next()?;
    ready.remove(name);
    if let Some(pos) = queue.iter().position(|n| *n == name) {
        queue.remove(pos);
    }
    Some(name)
}

/// Classic DFS-with-recursion-stack cycle check. Returns the offending
/// cycle path (e.g. `["a", "b", "a"]`) if a cycle involving `start` exists
/// anywhere in `nodes`, grounded on the original's `_has_cycle`.
fn find_cycle_through(nodes: &HashMap<String, Node>, start: &str) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        nodes: &'a HashMap<String, Node>,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| *n == name) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if visited.contains(name) {
            return None;
        }
        stack.push(name);
        if let Some(node) = nodes.get(name) {
            for upstream in &node.upstreams {
                if nodes.contains_key(upstream.as_str()) {
                    if let Some(cycle) = visit(nodes, upstream.as_str(), visited, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        visited.insert(name);
        None
    }

    visit(nodes, start, &mut visited, &mut stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_simple_dependency() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]).unwrap();
        g.add("b", vec!["a".into()]).unwrap();
        g.add("c", vec!["b".into()]).unwrap();
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn detect_direct_cycle() {
        let mut g = DependencyGraph::new();
        g.add("a", vec!["b".into()]).unwrap();
        let err = g.add("b", vec!["a".into()]).unwrap_err();
        assert!(matches!(err, DtError::Cycle(_)));
        assert!(!g.contains("b"));
    }

    #[test]
    fn detect_indirect_cycle() {
        let mut g = DependencyGraph::new();
        g.add("a", vec!["b".into()]).unwrap();
        g.add("b", vec!["c".into()]).unwrap();
        let err = g.add("c", vec!["a".into()]).unwrap_err();
        assert!(matches!(err, DtError::Cycle(_)));
    }

    #[test]
    fn detect_self_cycle() {
        let mut g = DependencyGraph::new();
        let err = g.add("a", vec!["a".into()]).unwrap_err();
        assert!(matches!(err, DtError::Cycle(_)));
    }

    #[test]
    fn topological_sort_simple() {
        let mut g = DependencyGraph::new();
        g.add("c", vec!["a".into(), "b".into()]).unwrap();
        g.add("b", vec!["a".into()]).unwrap();
        g.add("a", vec![]).unwrap();

        let order = g.topo_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn topological_sort_diamond() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]).unwrap();
        g.add("b", vec!["a".into()]).unwrap();
        g.add("c", vec!["a".into()]).unwrap();
        g.add("d", vec!["b".into(), "c".into()]).unwrap();

        let order = g.topo_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn base_table_upstreams_do_not_affect_ordering() {
        let mut g = DependencyGraph::new();
        g.add("v1", vec!["raw_sales".into()]).unwrap();
        let order = g.topo_order();
        assert_eq!(order, vec!["v1".to_string()]);
    }

    #[test]
    fn remove_table() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]).unwrap();
        g.add("b", vec!["a".into()]).unwrap();
        g.remove("b").unwrap();
        assert!(!g.contains("b"));
        assert!(g.contains("a"));
    }

    #[test]
    fn remove_blocked_by_dependents() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]).unwrap();
        g.add("b", vec!["a".into()]).unwrap();
        let err = g.remove("a").unwrap_err();
        match err {
            DtError::HasDependents(name, deps) => {
                assert_eq!(name, "a");
                assert_eq!(deps, vec!["b".to_string()]);
            }
            other => panic!("expected HasDependents, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut g = DependencyGraph::new();
        g.add("a", vec![]).unwrap();
        let err = g.add("a", vec![]).unwrap_err();
        assert!(matches!(err, DtError::AlreadyExists(_)));
    }
}

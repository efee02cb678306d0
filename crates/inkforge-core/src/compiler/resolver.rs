//! Dependency resolution: deterministic topological ordering, cycle
//! detection with a witness, and parallel wave grouping.
//!
//! The dependency graph is modelled with `petgraph`. The ordering itself is
//! a Kahn traversal with a min-heap over step ids, so that whenever several
//! steps are simultaneously runnable the lexically smallest id comes first.
//! This is what makes compilation deterministic: `petgraph::algo::toposort`
//! alone gives *a* valid order, not a reproducible one.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;

use petgraph::graph::{DiGraph, NodeIndex};

use super::CompileError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// A step id with its direct dependencies, as seen by the resolver.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub id: String,
    pub depends_on: Vec<String>,
}

fn build_graph(
    nodes: &[DependencyNode],
) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>), CompileError> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::with_capacity(nodes.len());

    for node in nodes {
        let idx = graph.add_node(node.id.clone());
        indices.insert(node.id.clone(), idx);
    }

    for node in nodes {
        let to = indices[&node.id];
        for dep in &node.depends_on {
            let from = indices.get(dep).ok_or_else(|| CompileError::UnknownDependency {
                step: node.id.clone(),
                dependency: dep.clone(),
            })?;
            // Edge from dependency to dependent.
            graph.add_edge(*from, to, ());
        }
    }

    Ok((graph, indices))
}

// ---------------------------------------------------------------------------
// Deterministic topological order
// ---------------------------------------------------------------------------

/// Produce the deterministic execution order for the given nodes.
///
/// Kahn's algorithm with a lexical min-heap tie-break. Fails with
/// [`CompileError::UnknownDependency`] on dangling edges and
/// [`CompileError::CircularDependency`] (carrying a cycle witness) when the
/// graph is cyclic.
pub fn deterministic_order(nodes: &[DependencyNode]) -> Result<Vec<String>, CompileError> {
    let (graph, indices) = build_graph(nodes)?;

    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, petgraph::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<String>> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(idx, _)| Reverse(graph[*idx].clone()))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        let idx = indices[&id];
        order.push(id);
        for succ in graph.neighbors_directed(idx, petgraph::Outgoing) {
            if let Some(deg) = indegree.get_mut(&succ) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(graph[succ].clone()));
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(CompileError::CircularDependency {
            cycle: cycle_witness(nodes, &order),
        });
    }

    Ok(order)
}

/// Walk the unresolved remainder of the graph to produce a readable cycle
/// path, e.g. `"a -> b -> a"`.
fn cycle_witness(nodes: &[DependencyNode], resolved: &[String]) -> String {
    let deps: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.as_slice()))
        .collect();

    let mut remaining: Vec<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !resolved.iter().any(|r| r == id))
        .collect();
    remaining.sort_unstable();

    let Some(&start) = remaining.first() else {
        return "unknown cycle".to_string();
    };

    // Follow unresolved dependencies until a node repeats.
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = deps
            .get(current)
            .and_then(|ds| {
                ds.iter()
                    .map(String::as_str)
                    .find(|d| remaining.contains(d))
            });
        let Some(next) = next else {
            return path.join(" -> ");
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            path.push(next);
            return path[pos..].join(" -> ");
        }
        path.push(next);
        current = next;
    }
}

// ---------------------------------------------------------------------------
// Parallel waves
// ---------------------------------------------------------------------------

/// Group steps into parallel waves.
///
/// Wave `k` contains every step whose dependencies are all satisfied by
/// waves `0..k`. Members of a wave may be dispatched concurrently; the
/// engine is free to run them sequentially instead. Each wave is sorted
/// lexically so group membership is deterministic too.
pub fn parallel_waves(nodes: &[DependencyNode], order: &[String]) -> Vec<Vec<String>> {
    let deps: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.as_slice()))
        .collect();

    let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());
    for id in order {
        let d = deps[id.as_str()]
            .iter()
            .map(|dep| depth.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
    }

    let wave_count = depth.values().copied().max().map_or(0, |m| m + 1);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); wave_count];
    for id in order {
        waves[depth[id.as_str()]].push(id.clone());
    }
    for wave in &mut waves {
        wave.sort_unstable();
    }
    waves
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

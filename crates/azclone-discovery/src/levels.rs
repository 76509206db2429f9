//! Dependency-level assignment.
//!
//! Every resource gets `level = 1 + max(level of its edge targets)`, leaves
//! get 0, so deploying levels in ascending order satisfies every edge.
//! Cycles are tolerated: when the walk meets a node already on the call
//! stack it uses the current recursion depth as that node's bound instead of
//! recursing further, so the computation always terminates.

use std::collections::{HashMap, HashSet};

/// Compute dependency levels for a set of nodes and directed edges
/// `(source, target)`. Edges mentioning unknown nodes are ignored.
pub fn compute_levels(node_ids: &[String], edges: &[(String, String)]) -> HashMap<String, i32> {
    let known: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in edges {
        if known.contains(source.as_str()) && known.contains(target.as_str()) {
            adjacency
                .entry(source.as_str())
                .or_default()
                .push(target.as_str());
        }
    }

    let mut levels: HashMap<String, i32> = HashMap::new();
    let mut visiting: HashSet<String> = HashSet::new();
    for node in node_ids {
        visit(node, &adjacency, &mut levels, &mut visiting, 0);
    }
    levels
}

fn visit(
    node: &str,
    adjacency: &HashMap<&str, Vec<&str>>,
    levels: &mut HashMap<String, i32>,
    visiting: &mut HashSet<String>,
    depth: i32,
) -> i32 {
    if let Some(&level) = levels.get(node) {
        return level;
    }
    if visiting.contains(node) {
        // Back-edge: bound the cycle with the current recursion depth.
        return depth;
    }

    visiting.insert(node.to_string());
    let mut level = 0;
    if let Some(targets) = adjacency.get(node) {
        for target in targets {
            level = level.max(1 + visit(target, adjacency, levels, visiting, depth + 1));
        }
    }
    visiting.remove(node);

    levels.insert(node.to_string(), level);
    level
}

//! KS-005: Batch scheduling.
//!
//! A frontier variant of Kahn's algorithm: every step whose dependencies are
//! all placed goes into the current batch, then the batch is removed and the
//! next frontier computed. Steps keep declaration order inside a batch, so the
//! same graph always yields the same plan.

use super::graph::StepGraph;
use super::types::ExecutionPlan;
use std::collections::HashMap;

/// Partition a validated graph into ordered batches.
///
/// The graph must be acyclic (see [`super::graph::build`]); steps caught in a
/// cycle would never reach the frontier and are left out.
pub fn plan(graph: &StepGraph) -> ExecutionPlan {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes()
        .map(|n| (n, graph.dependencies(n).len()))
        .collect();

    let mut batches = Vec::new();
    let mut frontier: Vec<&str> = graph.nodes().filter(|n| in_degree[n] == 0).collect();

    while !frontier.is_empty() {
        for done in &frontier {
            in_degree.remove(done);
        }
        let mut next: Vec<&str> = Vec::new();
        for done in &frontier {
            for dependent in graph.dependents(done) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort_by_key(|n| graph.position(n));
        batches.push(frontier.iter().map(|s| s.to_string()).collect());
        frontier = next;
    }

    ExecutionPlan { batches }
}

/// Split one batch into execution groups.
///
/// Consecutive parallel-hinted steps share a group and may run concurrently;
/// every step without the hint forms a group of its own, so it acts as a
/// boundary. Groups run in order.
pub fn concurrency_groups<F>(batch: &[String], is_parallel: F) -> Vec<Vec<String>>
where
    F: Fn(&str) -> bool,
{
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut open_parallel = false;

    for step in batch {
        if is_parallel(step) {
            match groups.last_mut() {
                Some(group) if open_parallel => group.push(step.clone()),
                _ => groups.push(vec![step.clone()]),
            }
            open_parallel = true;
        } else {
            groups.push(vec![step.clone()]);
            open_parallel = false;
        }
    }
    groups
}

//! KS-004: Dependency graph construction and structural validation.
//!
//! Builds a DAG from each step's `dependsOn` list and validates it
//! exhaustively: empty and duplicate names, missing or unrecognized tool
//! kinds, unknown dependencies, and cycles. All issues are returned together.

use super::types::*;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Validated dependency edges, keyed by step name in declaration order.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    /// step -> the steps it depends on
    deps: IndexMap<String, Vec<String>>,
}

impl StepGraph {
    /// Step names in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.deps.contains_key(step)
    }

    /// Direct dependencies of a step.
    pub fn dependencies(&self, step: &str) -> &[String] {
        self.deps.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps that directly depend on `step`, in declaration order.
    pub fn dependents(&self, step: &str) -> Vec<&str> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == step))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Position of a step in declaration order.
    pub fn position(&self, step: &str) -> Option<usize> {
        self.deps.get_index_of(step)
    }
}

/// Graph plus every structural issue found while building it.
#[derive(Debug, Clone, Default)]
pub struct GraphBuild {
    pub graph: StepGraph,
    pub issues: Vec<ValidationIssue>,
}

impl GraphBuild {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Convert into the graph, or the issue list if any were found.
    pub fn into_result(self) -> Result<StepGraph, Vec<ValidationIssue>> {
        if self.issues.is_empty() {
            Ok(self.graph)
        } else {
            Err(self.issues)
        }
    }
}

/// Build and validate the dependency graph for a step list.
pub fn build(steps: &[Step]) -> GraphBuild {
    let mut issues = Vec::new();
    let mut deps: IndexMap<String, Vec<String>> = IndexMap::new();

    let declared: HashSet<&str> = steps
        .iter()
        .map(|s| s.name.trim())
        .filter(|n| !n.is_empty())
        .collect();

    for (index, step) in steps.iter().enumerate() {
        let name = step.name.trim();
        if name.is_empty() {
            issues.push(ValidationIssue::new(
                IssueCode::MissingName,
                None,
                format!("step #{} has no name", index + 1),
            ));
            continue;
        }

        let duplicate = deps.contains_key(name);
        if duplicate {
            issues.push(ValidationIssue::new(
                IssueCode::DuplicateStepName,
                Some(name),
                format!("duplicate step name '{}'", name),
            ));
        }

        match step.kind() {
            Ok(_) => {}
            Err(IssueCode::MissingTool) => issues.push(ValidationIssue::new(
                IssueCode::MissingTool,
                Some(name),
                format!("step '{}' does not declare a tool", name),
            )),
            Err(code) => issues.push(ValidationIssue::new(
                code,
                Some(name),
                format!(
                    "step '{}' uses unrecognized tool '{}'",
                    name,
                    step.tool.as_deref().unwrap_or_default()
                ),
            )),
        }

        let mut edges = Vec::new();
        for dep in &step.depends_on {
            let dep = dep.trim();
            if !declared.contains(dep) {
                issues.push(ValidationIssue::new(
                    IssueCode::UnknownDependency,
                    Some(name),
                    format!("step '{}' depends on unknown step '{}'", name, dep),
                ));
            } else if !edges.iter().any(|e| e == dep) {
                edges.push(dep.to_string());
            }
        }

        if !duplicate {
            deps.insert(name.to_string(), edges);
        }
    }

    let graph = StepGraph { deps };
    for cycle in find_cycles(&graph) {
        issues.push(ValidationIssue::new(
            IssueCode::CircularDependency,
            cycle.first().map(String::as_str),
            format!("circular dependency: {}", cycle.join(" -> ")),
        ));
    }

    GraphBuild { graph, issues }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Depth-first walk over dependency edges. Every back-edge to a node still on
/// the current path yields one cycle, written from that node back to itself.
fn find_cycles(graph: &StepGraph) -> Vec<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.len()];
    let mut path: Vec<usize> = Vec::new();
    let mut cycles = Vec::new();

    fn visit(
        graph: &StepGraph,
        node: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks[node] = Mark::OnPath;
        path.push(node);

        let Some((_, deps)) = graph.deps.get_index(node) else {
            return;
        };
        for dep in deps {
            let Some(next) = graph.position(dep) else {
                continue;
            };
            match marks[next] {
                Mark::Unvisited => visit(graph, next, marks, path, cycles),
                Mark::OnPath => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .filter_map(|&n| graph.deps.get_index(n).map(|(k, _)| k.clone()))
                        .collect();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
    }

    for node in 0..graph.len() {
        if marks[node] == Mark::Unvisited {
            visit(graph, node, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}

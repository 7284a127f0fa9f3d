//! Dependency graph validation for orchestration admission.
//!
//! Admission is all-or-nothing: any duplicate identifier, unresolved
//! dependency name, negative post-dependency wait, or cycle rejects the
//! whole batch with a diagnostic naming the offender.

use std::collections::{HashMap, HashSet};

use crate::models::TaskSpec;
use crate::{CapstanError, Result};

/// Validate a batch of task specs as a DAG.
pub fn validate(specs: &[TaskSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(CapstanError::Orchestration(
            "an orchestration needs at least one task".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for spec in specs {
        if spec.task_identifier.trim().is_empty() {
            return Err(CapstanError::validation(
                "task_identifier",
                "must not be empty",
            ));
        }
        if !seen.insert(spec.task_identifier.as_str()) {
            return Err(CapstanError::DependencyGraph(format!(
                "task identifier '{}' is used twice",
                spec.task_identifier
            )));
        }
        if spec.wait_after_dependencies < 0.0 {
            return Err(CapstanError::validation(
                "wait_after_dependencies",
                format!(
                    "must be non-negative, got {} for '{}'",
                    spec.wait_after_dependencies, spec.task_identifier
                ),
            ));
        }
    }

    let members: HashMap<&str, &TaskSpec> = specs
        .iter()
        .map(|s| (s.task_identifier.as_str(), s))
        .collect();
    for spec in specs {
        for dep in &spec.depends_on {
            if !members.contains_key(dep.as_str()) {
                return Err(CapstanError::DependencyGraph(format!(
                    "'{}' depends on unknown task '{}'",
                    spec.task_identifier, dep
                )));
            }
        }
    }

    detect_cycle(specs, &members)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White, // unvisited
    Gray,  // on the current DFS path
    Black, // fully explored
}

/// Depth-first search with gray/black marking. The first back edge found is
/// reported with the full path that closes the cycle.
fn detect_cycle(specs: &[TaskSpec], members: &HashMap<&str, &TaskSpec>) -> Result<()> {
    let mut marks: HashMap<&str, Mark> = specs
        .iter()
        .map(|s| (s.task_identifier.as_str(), Mark::White))
        .collect();

    for spec in specs {
        if marks[spec.task_identifier.as_str()] == Mark::White {
            let mut path = Vec::new();
            visit(spec.task_identifier.as_str(), members, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    members: &HashMap<&'a str, &'a TaskSpec>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    marks.insert(node, Mark::Gray);
    path.push(node);

    for dep in &members[node].depends_on {
        match marks[dep.as_str()] {
            Mark::Gray => {
                // Back edge: close the path at the repeated node.
                let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(dep.as_str());
                return Err(CapstanError::DependencyGraph(format!(
                    "dependency cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            Mark::White => visit(dep.as_str(), members, marks, path)?,
            Mark::Black => {}
        }
    }

    path.pop();
    marks.insert(node, Mark::Black);
    Ok(())
}

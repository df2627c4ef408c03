use std::collections::{HashMap, HashSet, VecDeque};

use crate::step::Step;

/// Routing structure derived from a template's steps.
///
/// Edges come from exit-path targets, decision-matrix targets, and manual
/// override options; alternative-template branches leave the graph and are
/// not edges here.
#[derive(Debug, Clone)]
pub struct StepGraph {
  /// step_id -> step ids it can route to.
  adjacency: HashMap<String, Vec<String>>,
}

impl StepGraph {
  pub fn new(steps: &[Step]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for step in steps {
      let targets = adjacency.entry(step.step_id.clone()).or_default();
      for id in step.referenced_step_ids() {
        if !targets.iter().any(|t| t == id) {
          targets.push(id.to_string());
        }
      }
    }

    Self { adjacency }
  }

  /// Step ids this step can route to.
  pub fn downstream(&self, step_id: &str) -> &[String] {
    self
      .adjacency
      .get(step_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// All step ids reachable from `start`, including `start` itself.
  pub fn reachable_from(&self, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();

    if self.adjacency.contains_key(start) {
      seen.insert(start.to_string());
      queue.push_back(start.to_string());
    }

    while let Some(current) = queue.pop_front() {
      for next in self.downstream(&current) {
        if seen.insert(next.clone()) {
          queue.push_back(next.clone());
        }
      }
    }

    seen
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::step::{ExitPath, PathTarget, Step, StepType};

  fn step(id: &str, next: &[&str]) -> Step {
    Step {
      step_id: id.to_string(),
      name: id.to_string(),
      description: String::new(),
      step_type: StepType::Exam,
      on_entry_actions: Vec::new(),
      decision_point: None,
      exit_paths: next
        .iter()
        .enumerate()
        .map(|(i, target)| ExitPath {
          path_id: format!("{id}-p{i}"),
          name: format!("to {target}"),
          conditions: Vec::new(),
          actions: Vec::new(),
          target: PathTarget::NextStep {
            step_id: target.to_string(),
          },
          probability: None,
        })
        .collect(),
      quality_checks: Vec::new(),
      terminal: next.is_empty(),
      fallback_to_review: false,
      estimated_duration_days: None,
      max_wait_days: None,
    }
  }

  #[test]
  fn reachability_walks_exit_paths() {
    let steps = vec![
      step("a", &["b", "c"]),
      step("b", &["d"]),
      step("c", &["d"]),
      step("d", &[]),
      step("orphan", &[]),
    ];
    let graph = StepGraph::new(&steps);
    let reachable = graph.reachable_from("a");

    assert_eq!(reachable.len(), 4);
    assert!(reachable.contains("d"));
    assert!(!reachable.contains("orphan"));
  }

  #[test]
  fn unknown_start_reaches_nothing() {
    let graph = StepGraph::new(&[step("a", &[])]);
    assert!(graph.reachable_from("missing").is_empty());
  }
}

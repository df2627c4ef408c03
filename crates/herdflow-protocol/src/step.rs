use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::condition::Condition;
use crate::decision::DecisionPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
  Exam,
  Injection,
  Procedure,
  Wait,
  Decision,
  Notification,
}

/// Where a path or decision outcome routes the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathTarget {
  NextStep { step_id: String },
  AlternativeTemplate { template_id: String },
}

impl PathTarget {
  pub fn step_id(&self) -> Option<&str> {
    match self {
      PathTarget::NextStep { step_id } => Some(step_id),
      PathTarget::AlternativeTemplate { .. } => None,
    }
  }
}

/// A conditioned route out of a step.
///
/// Paths are evaluated in declaration order; the first whose condition
/// chain holds is taken. `probability` is advisory metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPath {
  pub path_id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub conditions: Vec<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<Action>,
  pub target: PathTarget,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub probability: Option<f64>,
}

impl ExitPath {
  /// A path with no conditions always matches.
  pub fn is_unconditional(&self) -> bool {
    self.conditions.is_empty()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
  Warning,
  Error,
  Critical,
}

/// A post-action quality gate, separate from exit conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
  pub check_id: String,
  pub name: String,
  pub condition: Condition,
  pub severity: CheckSeverity,
  #[serde(default)]
  pub requires_verification: bool,
}

/// One node of a protocol step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub step_id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub step_type: StepType,
  /// Dispatched when the instance enters this step.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_entry_actions: Vec<Action>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub decision_point: Option<DecisionPoint>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub exit_paths: Vec<ExitPath>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub quality_checks: Vec<QualityCheck>,
  /// Entering a terminal step completes the instance.
  #[serde(default)]
  pub terminal: bool,
  /// Explicit manual-review terminal for the no-path-matched case.
  #[serde(default)]
  pub fallback_to_review: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub estimated_duration_days: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_wait_days: Option<u32>,
}

impl Step {
  /// Step ids this step can route to inside the same template.
  pub fn referenced_step_ids(&self) -> Vec<&str> {
    let mut ids = Vec::new();
    for path in &self.exit_paths {
      if let Some(id) = path.target.step_id() {
        ids.push(id);
      }
    }
    if let Some(dp) = &self.decision_point {
      for outcome in &dp.matrix {
        if let Some(id) = outcome.target.as_ref().and_then(PathTarget::step_id) {
          ids.push(id);
        }
      }
      for option in &dp.manual_options {
        if let Some(id) = option.target.step_id() {
          ids.push(id);
        }
      }
    }
    ids
  }

  /// Alternative template ids this step can branch to.
  pub fn referenced_template_ids(&self) -> Vec<&str> {
    let mut ids = Vec::new();
    for path in &self.exit_paths {
      if let PathTarget::AlternativeTemplate { template_id } = &path.target {
        ids.push(template_id.as_str());
      }
    }
    if let Some(dp) = &self.decision_point {
      for outcome in &dp.matrix {
        if let Some(PathTarget::AlternativeTemplate { template_id }) = &outcome.target {
          ids.push(template_id.as_str());
        }
      }
      for option in &dp.manual_options {
        if let PathTarget::AlternativeTemplate { template_id } = &option.target {
          ids.push(template_id.as_str());
        }
      }
    }
    ids
  }
}

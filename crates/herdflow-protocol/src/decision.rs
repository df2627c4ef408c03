use serde::{Deserialize, Serialize};

use crate::action::{Action, Urgency};
use crate::condition::Condition;
use crate::step::PathTarget;

/// Classified result of a decision-point evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
  Success,
  PartialSuccess,
  Failure,
  AlternativeNeeded,
}

impl OutcomeKind {
  /// Whether this outcome is selectable when the evaluation chain held.
  pub fn positive(&self) -> bool {
    matches!(self, OutcomeKind::Success | OutcomeKind::PartialSuccess)
  }
}

/// One row of a decision matrix.
///
/// `probability` is advisory analytics metadata; selection is by outcome
/// classification and declaration order, never by weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
  pub outcome: OutcomeKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub probability: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target: Option<PathTarget>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub required_actions: Vec<Action>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// A manual route a veterinarian may take instead of the automatic outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOption {
  pub option_id: String,
  pub label: String,
  #[serde(default)]
  pub description: String,
  pub target: PathTarget,
  #[serde(default)]
  pub requires_justification: bool,
}

/// Condition under which the decision is taken away from the automatic
/// path and handed to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
  pub condition: Condition,
  /// Veterinarian id or role to hand the case to.
  pub escalate_to: String,
  pub urgency: Urgency,
  pub message: String,
}

/// Observed outcome frequencies, carried for reporting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOutcome {
  pub outcome: String,
  pub frequency: u32,
  pub success_rate: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub average_hours_to_decision: Option<f64>,
}

/// A weighted multi-outcome branch point with escalation and optional
/// manual override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
  pub decision_id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub evaluation_conditions: Vec<Condition>,
  pub matrix: Vec<DecisionOutcome>,
  #[serde(default)]
  pub allow_manual_override: bool,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub manual_options: Vec<ManualOption>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub escalation_rules: Vec<EscalationRule>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub historical_outcomes: Vec<HistoricalOutcome>,
}

impl DecisionPoint {
  pub fn manual_option(&self, option_id: &str) -> Option<&ManualOption> {
    self.manual_options.iter().find(|o| o.option_id == option_id)
  }
}

use serde::{Deserialize, Serialize};

use crate::graph::StepGraph;
use crate::step::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
  DonorComplete,
  RecipientSync,
  BreedingCycle,
  Custom,
}

impl std::fmt::Display for TemplateCategory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      TemplateCategory::DonorComplete => "donor_complete",
      TemplateCategory::RecipientSync => "recipient_sync",
      TemplateCategory::BreedingCycle => "breeding_cycle",
      TemplateCategory::Custom => "custom",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectRole {
  Donor,
  Recipient,
  Breeding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  Medium,
  High,
  Urgent,
}

impl Default for Priority {
  fn default() -> Self {
    Priority::Medium
  }
}

/// A mid-protocol branch rule: when a step routes to `target_template_id`,
/// this rule governs data carryover and approval.
///
/// Context fields named in `preserve_data` are copied into the new
/// instance; `reset_data` fields are explicitly cleared. Fields in
/// neither list are cleared as well: carryover fails closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeRule {
  pub rule_id: String,
  #[serde(default)]
  pub trigger_description: String,
  pub target_template_id: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub preserve_data: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reset_data: Vec<String>,
  #[serde(default)]
  pub requires_approval: bool,
}

/// A reusable protocol step graph.
///
/// Templates are immutable once registered; `version` is assigned by the
/// registry and running instances pin the version they started on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTemplate {
  pub template_id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub category: TemplateCategory,
  #[serde(default)]
  pub version: u32,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub applicable_roles: Vec<SubjectRole>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub applicable_species: Vec<String>,
  pub steps: Vec<Step>,
  pub starting_step: String,
  pub max_duration_days: u32,
  #[serde(default)]
  pub priority: Priority,
  /// Dispatch the starting step's entry actions at assignment time.
  #[serde(default)]
  pub auto_start: bool,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub alternative_rules: Vec<AlternativeRule>,
  /// Opaque advisory metadata (prediction model, historical analytics).
  /// Surfaced to reporting, never consulted by the engine.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prediction: Option<serde_json::Value>,
}

impl ProtocolTemplate {
  pub fn step(&self, step_id: &str) -> Option<&Step> {
    self.steps.iter().find(|s| s.step_id == step_id)
  }

  pub fn total_steps(&self) -> usize {
    self.steps.len()
  }

  /// The rule governing a branch to `template_id`, if the author declared one.
  pub fn alternative_rule_for(&self, template_id: &str) -> Option<&AlternativeRule> {
    self
      .alternative_rules
      .iter()
      .find(|r| r.target_template_id == template_id)
  }

  /// Build the routing graph for traversal and validation.
  pub fn graph(&self) -> StepGraph {
    StepGraph::new(&self.steps)
  }
}

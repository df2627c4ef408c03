use std::collections::HashMap;

use chrono::{DateTime, Utc};
use herdflow_protocol::{Priority, TemplateCategory, Urgency};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InstanceStatus {
  Active,
  Paused,
  Completed,
  Failed,
  Cancelled,
  PendingApproval,
}

impl InstanceStatus {
  /// Terminal statuses never transition again.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
    )
  }
}

/// One subject's live progress through a protocol template.
///
/// Mutated only by the instance manager through transitions; the
/// `block_reason` sub-status is always a human-readable string so blocked
/// instances are never silent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowInstance {
  pub instance_id: String,
  pub subject_id: String,
  pub template_id: String,
  pub template_version: u32,
  pub category: Json<TemplateCategory>,
  pub current_step_id: String,
  pub status: InstanceStatus,
  pub block_reason: Option<String>,
  pub completed_steps: Json<Vec<String>>,
  pub failed_steps: Json<Vec<String>>,
  pub skipped_steps: Json<Vec<String>>,
  /// Attempts consumed per action id, persisted across triggers.
  pub retry_counters: Json<HashMap<String, u32>>,
  /// Carried context data; populated by alternative-workflow transitions.
  pub context: Json<serde_json::Value>,
  pub priority: Json<Priority>,
  pub owner: Option<String>,
  pub notes: Json<Vec<String>>,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Set when this instance was cancelled in favor of an alternative one.
  pub superseded_by: Option<String>,
}

impl WorkflowInstance {
  pub fn is_blocked(&self) -> bool {
    self.block_reason.is_some()
  }
}

/// Kind of audit timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TimelineKind {
  Assigned,
  Decision,
  Transition,
  Blocked,
  Escalation,
  StatusChange,
  Note,
}

/// Human-readable audit line, one per notable instance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TimelineEntry {
  pub entry_id: String,
  pub instance_id: String,
  pub step_id: Option<String>,
  pub kind: TimelineKind,
  pub message: String,
  pub at: DateTime<Utc>,
}

/// Why an alternative-workflow branch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TriggerReason {
  ConditionFailed,
  ManualDecision,
  Emergency,
  Optimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AssignmentStatus {
  PendingApproval,
  Applied,
  Rejected,
}

/// Record of a branch to a different protocol template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AlternativeAssignment {
  pub assignment_id: String,
  pub instance_id: String,
  pub step_id: String,
  pub trigger_reason: TriggerReason,
  pub target_template_id: String,
  /// Context fields copied into the new instance, as applied.
  pub preserved: Json<Vec<String>>,
  /// Context fields explicitly cleared, as declared by the rule.
  pub reset: Json<Vec<String>>,
  pub requires_approval: bool,
  pub approved_by: Option<String>,
  pub approved_at: Option<DateTime<Utc>>,
  pub status: AssignmentStatus,
  pub new_instance_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// A handoff to a human reviewer. Persisted and queryable, never dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EscalationRecord {
  pub escalation_id: String,
  pub instance_id: String,
  pub step_id: Option<String>,
  pub action_id: Option<String>,
  pub message: String,
  pub escalate_to: String,
  pub urgency: Json<Urgency>,
  pub raised_at: DateTime<Utc>,
  pub acknowledged_at: Option<DateTime<Utc>>,
}

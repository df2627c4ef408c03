use serde::{Deserialize, Serialize};

/// External module an action is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
  Ultrasound,
  Injection,
  Calendar,
  Breeding,
  Flushing,
  Status,
  Notification,
  /// Actions settled inside the engine itself (wait markers), never
  /// forwarded to an adapter.
  Internal,
}

impl std::fmt::Display for ModuleKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ModuleKind::Ultrasound => "ultrasound",
      ModuleKind::Injection => "injection",
      ModuleKind::Calendar => "calendar",
      ModuleKind::Breeding => "breeding",
      ModuleKind::Flushing => "flushing",
      ModuleKind::Status => "status",
      ModuleKind::Notification => "notification",
      ModuleKind::Internal => "internal",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
  Low,
  Normal,
  High,
  Urgent,
}

impl Default for ActionPriority {
  fn default() -> Self {
    ActionPriority::Normal
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
  Routine,
  Urgent,
  Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionRoute {
  Im,
  Iv,
  Sc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureType {
  EmbryoTransfer,
  Opu,
  Flushing,
  Breeding,
}

/// Typed parameters per action kind.
///
/// The variant is the action type; each target adapter receives a
/// statically known shape instead of an open key/value map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionParams {
  ScheduleExam {
    exam_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_vet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
  },
  ScheduleInjection {
    medication: String,
    dosage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    route: Option<InjectionRoute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
  },
  ScheduleProcedure {
    procedure_type: ProcedureType,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
  },
  UpdateStatus {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },
  Notify {
    recipient: String,
    message: String,
    urgency: Urgency,
  },
  WaitDays {
    days: u32,
  },
}

impl ActionParams {
  /// Short label for logs and timeline entries.
  pub fn kind(&self) -> &'static str {
    match self {
      ActionParams::ScheduleExam { .. } => "schedule_exam",
      ActionParams::ScheduleInjection { .. } => "schedule_injection",
      ActionParams::ScheduleProcedure { .. } => "schedule_procedure",
      ActionParams::UpdateStatus { .. } => "update_status",
      ActionParams::Notify { .. } => "notify",
      ActionParams::WaitDays { .. } => "wait_days",
    }
  }
}

/// Delay applied before an action is submitted to its module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDelay {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub days: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub hours: Option<u32>,
}

impl ActionDelay {
  pub fn is_zero(&self) -> bool {
    self.days.unwrap_or(0) == 0 && self.hours.unwrap_or(0) == 0
  }
}

/// Retry and escalation policy for a failed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
  /// Retries after the initial attempt. `retry_attempts = 2` means three
  /// total attempts before escalation.
  #[serde(default)]
  pub retry_attempts: u32,
  #[serde(default)]
  pub retry_delay_hours: u32,
  pub escalation_message: String,
  #[serde(default)]
  pub notify_veterinarian: bool,
  /// When true, an escalated action does not block the transition commit.
  #[serde(default)]
  pub accept_partial_failure: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fallback_action: Option<Box<Action>>,
}

impl Default for FailurePolicy {
  fn default() -> Self {
    Self {
      retry_attempts: 0,
      retry_delay_hours: 0,
      escalation_message: "action failed and exhausted its retries".to_string(),
      notify_veterinarian: true,
      accept_partial_failure: false,
      fallback_action: None,
    }
  }
}

/// A side-effecting action dispatched to an external module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
  pub action_id: String,
  #[serde(flatten)]
  pub params: ActionParams,
  pub target_module: ModuleKind,
  #[serde(default)]
  pub priority: ActionPriority,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub delay: Option<ActionDelay>,
  #[serde(default)]
  pub failure_policy: FailurePolicy,
}

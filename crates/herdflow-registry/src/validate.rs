use std::collections::HashSet;

use herdflow_protocol::{Action, ActionParams, Condition, ModuleKind, ProtocolTemplate, Step};

use crate::error::TemplateValidationError;

/// Validate a template before it becomes registered and immutable.
///
/// Everything here is rejected at registration, never at run time: the
/// engine assumes a registered template has a reachable, dead-end-free
/// step graph with well-formed conditions and actions.
pub fn validate(template: &ProtocolTemplate) -> Result<(), TemplateValidationError> {
  let template_id = &template.template_id;

  if template.steps.is_empty() {
    return Err(TemplateValidationError::NoSteps {
      template_id: template_id.clone(),
    });
  }

  if template.max_duration_days == 0 {
    return Err(TemplateValidationError::ZeroDuration {
      template_id: template_id.clone(),
    });
  }

  let mut step_ids = HashSet::new();
  for step in &template.steps {
    if !step_ids.insert(step.step_id.as_str()) {
      return Err(TemplateValidationError::DuplicateStepId {
        template_id: template_id.clone(),
        step_id: step.step_id.clone(),
      });
    }
  }

  if !step_ids.contains(template.starting_step.as_str()) {
    return Err(TemplateValidationError::StartingStepMissing {
      template_id: template_id.clone(),
      starting_step: template.starting_step.clone(),
    });
  }

  for step in &template.steps {
    for target in step.referenced_step_ids() {
      if !step_ids.contains(target) {
        return Err(TemplateValidationError::UnknownStepTarget {
          template_id: template_id.clone(),
          step_id: step.step_id.clone(),
          target: target.to_string(),
        });
      }
    }
    validate_step(template_id, step)?;
  }

  let reachable = template.graph().reachable_from(&template.starting_step);
  for step in &template.steps {
    if !reachable.contains(&step.step_id) {
      return Err(TemplateValidationError::UnreachableStep {
        template_id: template_id.clone(),
        step_id: step.step_id.clone(),
      });
    }
  }

  Ok(())
}

fn validate_step(template_id: &str, step: &Step) -> Result<(), TemplateValidationError> {
  let has_paths = !step.exit_paths.is_empty();
  let has_decision = step.decision_point.is_some();

  if !step.terminal && !has_paths && !has_decision {
    return Err(TemplateValidationError::DeadEndStep {
      template_id: template_id.to_string(),
      step_id: step.step_id.clone(),
    });
  }

  // A non-terminal exit-path step must always resolve somewhere: an
  // unconditional path, or an explicit manual-review fallback.
  if !step.terminal && has_paths && !has_decision {
    let has_default = step.exit_paths.iter().any(|p| p.is_unconditional());
    if !has_default && !step.fallback_to_review {
      return Err(TemplateValidationError::NoFallbackPath {
        template_id: template_id.to_string(),
        step_id: step.step_id.clone(),
      });
    }
  }

  if let Some(dp) = &step.decision_point {
    if dp.matrix.is_empty() {
      return Err(TemplateValidationError::EmptyDecisionMatrix {
        step_id: step.step_id.clone(),
      });
    }
    for condition in &dp.evaluation_conditions {
      validate_condition(&step.step_id, condition)?;
    }
    for rule in &dp.escalation_rules {
      validate_condition(&step.step_id, &rule.condition)?;
    }
    for outcome in &dp.matrix {
      for action in &outcome.required_actions {
        validate_action(&step.step_id, action)?;
      }
    }
  }

  for path in &step.exit_paths {
    for condition in &path.conditions {
      validate_condition(&step.step_id, condition)?;
    }
    for action in &path.actions {
      validate_action(&step.step_id, action)?;
    }
  }

  for action in &step.on_entry_actions {
    validate_action(&step.step_id, action)?;
  }

  for check in &step.quality_checks {
    validate_condition(&step.step_id, &check.condition)?;
  }

  Ok(())
}

fn validate_condition(step_id: &str, condition: &Condition) -> Result<(), TemplateValidationError> {
  // Tolerance and units only make sense over numeric comparisons; a
  // mismatch is an authoring error caught here, not at evaluation.
  if !condition.value.is_numeric() {
    if condition.tolerance.is_some() {
      return Err(TemplateValidationError::NonNumericTolerance {
        step_id: step_id.to_string(),
        condition_id: condition.condition_id.clone(),
        what: "a tolerance",
      });
    }
    if condition.unit.is_some() {
      return Err(TemplateValidationError::NonNumericTolerance {
        step_id: step_id.to_string(),
        condition_id: condition.condition_id.clone(),
        what: "a unit",
      });
    }
  }
  Ok(())
}

fn validate_action(step_id: &str, action: &Action) -> Result<(), TemplateValidationError> {
  if matches!(action.params, ActionParams::WaitDays { .. })
    && action.target_module != ModuleKind::Internal
  {
    return Err(TemplateValidationError::WaitActionNotInternal {
      step_id: step_id.to_string(),
      action_id: action.action_id.clone(),
    });
  }
  if let Some(fallback) = &action.failure_policy.fallback_action {
    validate_action(step_id, fallback)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use herdflow_protocol::{
    ActionDelay, ActionPriority, CompareOp, DecisionOutcome, DecisionPoint, ExitPath,
    FailurePolicy, FieldRef, FieldValue, OutcomeKind, PathTarget, Priority, StepType,
    TemplateCategory,
  };

  fn terminal_step(id: &str) -> Step {
    Step {
      step_id: id.to_string(),
      name: id.to_string(),
      description: String::new(),
      step_type: StepType::Notification,
      on_entry_actions: Vec::new(),
      decision_point: None,
      exit_paths: Vec::new(),
      quality_checks: Vec::new(),
      terminal: true,
      fallback_to_review: false,
      estimated_duration_days: None,
      max_wait_days: None,
    }
  }

  fn linked_step(id: &str, next: &str) -> Step {
    Step {
      step_id: id.to_string(),
      name: id.to_string(),
      description: String::new(),
      step_type: StepType::Exam,
      on_entry_actions: Vec::new(),
      decision_point: None,
      exit_paths: vec![ExitPath {
        path_id: format!("{id}-default"),
        name: "default".to_string(),
        conditions: Vec::new(),
        actions: Vec::new(),
        target: PathTarget::NextStep {
          step_id: next.to_string(),
        },
        probability: None,
      }],
      quality_checks: Vec::new(),
      terminal: false,
      fallback_to_review: false,
      estimated_duration_days: None,
      max_wait_days: None,
    }
  }

  fn template(steps: Vec<Step>, starting: &str) -> ProtocolTemplate {
    ProtocolTemplate {
      template_id: "tpl".to_string(),
      name: "test".to_string(),
      description: String::new(),
      category: TemplateCategory::Custom,
      version: 0,
      applicable_roles: Vec::new(),
      applicable_species: Vec::new(),
      steps,
      starting_step: starting.to_string(),
      max_duration_days: 30,
      priority: Priority::Medium,
      auto_start: false,
      alternative_rules: Vec::new(),
      prediction: None,
    }
  }

  #[test]
  fn accepts_linear_template() {
    let tpl = template(vec![linked_step("a", "b"), terminal_step("b")], "a");
    assert!(validate(&tpl).is_ok());
  }

  #[test]
  fn rejects_missing_starting_step() {
    let tpl = template(vec![terminal_step("a")], "nope");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::StartingStepMissing { .. })
    ));
  }

  #[test]
  fn rejects_dead_end_without_terminal_marking() {
    let mut dead = terminal_step("b");
    dead.terminal = false;
    let tpl = template(vec![linked_step("a", "b"), dead], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::DeadEndStep { .. })
    ));
  }

  #[test]
  fn rejects_unreachable_step() {
    let tpl = template(
      vec![linked_step("a", "b"), terminal_step("b"), terminal_step("island")],
      "a",
    );
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::UnreachableStep { step_id, .. }) if step_id == "island"
    ));
  }

  #[test]
  fn rejects_unknown_target() {
    let tpl = template(vec![linked_step("a", "ghost")], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::UnknownStepTarget { target, .. }) if target == "ghost"
    ));
  }

  #[test]
  fn rejects_conditional_paths_without_fallback() {
    let mut step = linked_step("a", "b");
    step.exit_paths[0].conditions.push(Condition {
      condition_id: "c1".to_string(),
      field: FieldRef::new("follicle_count"),
      operator: CompareOp::Gte,
      value: FieldValue::Number(3.0),
      tolerance: None,
      unit: None,
      time_constraint: None,
      skip_if_missing: false,
      logical_operator: None,
    });
    let tpl = template(vec![step, terminal_step("b")], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::NoFallbackPath { .. })
    ));
  }

  #[test]
  fn conditional_paths_accepted_with_review_fallback() {
    let mut step = linked_step("a", "b");
    step.exit_paths[0].conditions.push(Condition {
      condition_id: "c1".to_string(),
      field: FieldRef::new("follicle_count"),
      operator: CompareOp::Gte,
      value: FieldValue::Number(3.0),
      tolerance: None,
      unit: None,
      time_constraint: None,
      skip_if_missing: false,
      logical_operator: None,
    });
    step.fallback_to_review = true;
    let tpl = template(vec![step, terminal_step("b")], "a");
    assert!(validate(&tpl).is_ok());
  }

  #[test]
  fn rejects_tolerance_on_text_value() {
    let mut step = linked_step("a", "b");
    step.fallback_to_review = true;
    step.exit_paths[0].conditions.push(Condition {
      condition_id: "c1".to_string(),
      field: FieldRef::new("uterine_status"),
      operator: CompareOp::Eq,
      value: FieldValue::Text("healthy".to_string()),
      tolerance: Some(0.5),
      unit: None,
      time_constraint: None,
      skip_if_missing: false,
      logical_operator: None,
    });
    let tpl = template(vec![step, terminal_step("b")], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::NonNumericTolerance { .. })
    ));
  }

  #[test]
  fn rejects_empty_decision_matrix() {
    let mut step = terminal_step("a");
    step.terminal = false;
    step.decision_point = Some(DecisionPoint {
      decision_id: "d1".to_string(),
      name: "check".to_string(),
      description: String::new(),
      evaluation_conditions: Vec::new(),
      matrix: Vec::new(),
      allow_manual_override: false,
      manual_options: Vec::new(),
      escalation_rules: Vec::new(),
      historical_outcomes: Vec::new(),
    });
    let tpl = template(vec![step], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::EmptyDecisionMatrix { .. })
    ));
  }

  #[test]
  fn decision_matrix_targets_are_checked() {
    let mut step = terminal_step("a");
    step.terminal = false;
    step.decision_point = Some(DecisionPoint {
      decision_id: "d1".to_string(),
      name: "check".to_string(),
      description: String::new(),
      evaluation_conditions: Vec::new(),
      matrix: vec![DecisionOutcome {
        outcome: OutcomeKind::Success,
        probability: Some(80.0),
        target: Some(PathTarget::NextStep {
          step_id: "ghost".to_string(),
        }),
        required_actions: Vec::new(),
        notes: None,
      }],
      allow_manual_override: false,
      manual_options: Vec::new(),
      escalation_rules: Vec::new(),
      historical_outcomes: Vec::new(),
    });
    let tpl = template(vec![step], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::UnknownStepTarget { target, .. }) if target == "ghost"
    ));
  }

  #[test]
  fn wait_actions_must_stay_internal() {
    use herdflow_protocol::{Action, ActionParams, ModuleKind};
    let mut step = linked_step("a", "b");
    step.on_entry_actions.push(Action {
      action_id: "w1".to_string(),
      params: ActionParams::WaitDays { days: 3 },
      target_module: ModuleKind::Calendar,
      priority: ActionPriority::Normal,
      delay: Some(ActionDelay::default()),
      failure_policy: FailurePolicy::default(),
    });
    let tpl = template(vec![step, terminal_step("b")], "a");
    assert!(matches!(
      validate(&tpl),
      Err(TemplateValidationError::WaitActionNotInternal { .. })
    ));
  }
}

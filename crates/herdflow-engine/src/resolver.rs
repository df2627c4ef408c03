//! Step transition resolution.
//!
//! Given a step and a fresh snapshot, picks the route out: an exit path
//! (first declared match wins), a decision-matrix outcome (classified by
//! the evaluation chain, first declared candidate wins), an escalation
//! override, or a manual review. `probability` fields are advisory and
//! never influence the choice, so resolving the same snapshot twice
//! always picks the same route.

use herdflow_protocol::{Action, DecisionPoint, PathTarget, Snapshot, Step, Urgency};
use tracing::debug;

use crate::error::EngineError;
use crate::evaluator::{evaluate, evaluate_chain};

/// A veterinarian's override of an automatic decision.
#[derive(Debug, Clone)]
pub struct ManualSelection {
  pub option_id: String,
  pub justification: Option<String>,
  pub decided_by: String,
}

/// Where the resolved transition routes the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionDecision {
  Advance { next_step_id: String },
  Alternative { template_id: String },
  ManualReview { reason: String },
  Escalate {
    escalate_to: String,
    urgency: Urgency,
    message: String,
  },
}

/// Resolution output: the route plus the actions that must settle before
/// the transition commits.
#[derive(Debug, Clone)]
pub struct ResolvedTransition {
  pub decision: TransitionDecision,
  pub actions: Vec<Action>,
  /// Human-readable reasoning for the audit timeline.
  pub label: String,
  /// The current step is recorded as failed rather than completed.
  pub step_failed: bool,
  /// The current step was routed past without its conditions being met.
  pub step_skipped: bool,
}

impl ResolvedTransition {
  fn routed(decision: TransitionDecision, actions: Vec<Action>, label: String) -> Self {
    Self {
      decision,
      actions,
      label,
      step_failed: false,
      step_skipped: false,
    }
  }
}

/// Resolve the next transition for a step.
pub fn resolve_next(
  step: &Step,
  snapshot: &Snapshot,
  manual: Option<&ManualSelection>,
) -> Result<ResolvedTransition, EngineError> {
  if let Some(dp) = &step.decision_point {
    return resolve_decision(step, dp, snapshot, manual);
  }

  if manual.is_some() {
    return Err(EngineError::ManualOverrideRejected {
      reason: format!("step '{}' has no decision point", step.step_id),
    });
  }

  // Exit paths in declaration order; the first whose chain holds wins.
  for path in &step.exit_paths {
    if evaluate_chain(&path.conditions, snapshot) {
      debug!(step_id = %step.step_id, path_id = %path.path_id, "exit_path_matched");
      return Ok(ResolvedTransition::routed(
        target_decision(&path.target),
        path.actions.clone(),
        format!("exit path '{}' matched", path.name),
      ));
    }
  }

  // Validation guarantees this dead end was authored deliberately.
  Ok(ResolvedTransition::routed(
    TransitionDecision::ManualReview {
      reason: format!(
        "no exit path of step '{}' matched the current data",
        step.step_id
      ),
    },
    Vec::new(),
    format!("no exit path matched on step '{}'", step.step_id),
  ))
}

fn resolve_decision(
  step: &Step,
  dp: &DecisionPoint,
  snapshot: &Snapshot,
  manual: Option<&ManualSelection>,
) -> Result<ResolvedTransition, EngineError> {
  if let Some(selection) = manual {
    return resolve_manual(step, dp, snapshot, selection);
  }

  let evaluation = evaluate_chain(&dp.evaluation_conditions, snapshot);

  // Escalation rules trump the automatic outcome.
  for rule in &dp.escalation_rules {
    if evaluate(&rule.condition, snapshot) {
      return Ok(ResolvedTransition::routed(
        TransitionDecision::Escalate {
          escalate_to: rule.escalate_to.clone(),
          urgency: rule.urgency,
          message: rule.message.clone(),
        },
        Vec::new(),
        format!("escalation rule held on decision '{}': {}", dp.name, rule.message),
      ));
    }
  }

  // Ties between candidate outcomes break by declaration order; the
  // advisory probability is never consulted.
  let candidate = dp
    .matrix
    .iter()
    .find(|outcome| outcome.outcome.positive() == evaluation);

  let Some(outcome) = candidate else {
    return Ok(ResolvedTransition::routed(
      TransitionDecision::ManualReview {
        reason: format!(
          "decision '{}' evaluated {} but the matrix declares no matching outcome",
          dp.name,
          if evaluation { "positive" } else { "negative" }
        ),
      },
      Vec::new(),
      format!("decision '{}' had no matching outcome", dp.name),
    ));
  };

  let Some(target) = &outcome.target else {
    return Ok(ResolvedTransition::routed(
      TransitionDecision::ManualReview {
        reason: format!(
          "decision '{}' selected outcome {:?} which declares no routing target",
          dp.name, outcome.outcome
        ),
      },
      Vec::new(),
      format!("decision '{}' outcome has no target", dp.name),
    ));
  };

  debug!(
    step_id = %step.step_id,
    decision = %dp.name,
    outcome = ?outcome.outcome,
    "decision_outcome_selected"
  );

  Ok(ResolvedTransition {
    decision: target_decision(target),
    actions: outcome.required_actions.clone(),
    label: format!("decision '{}' selected outcome {:?}", dp.name, outcome.outcome),
    step_failed: !outcome.outcome.positive(),
    step_skipped: false,
  })
}

fn resolve_manual(
  step: &Step,
  dp: &DecisionPoint,
  snapshot: &Snapshot,
  selection: &ManualSelection,
) -> Result<ResolvedTransition, EngineError> {
  if !dp.allow_manual_override {
    return Err(EngineError::ManualOverrideRejected {
      reason: format!("decision '{}' does not allow manual override", dp.name),
    });
  }

  let Some(option) = dp.manual_option(&selection.option_id) else {
    return Err(EngineError::ManualOverrideRejected {
      reason: format!(
        "decision '{}' has no manual option '{}'",
        dp.name, selection.option_id
      ),
    });
  };

  if option.requires_justification
    && selection
      .justification
      .as_deref()
      .is_none_or(|j| j.trim().is_empty())
  {
    return Err(EngineError::ManualOverrideRejected {
      reason: format!("manual option '{}' requires a justification", option.label),
    });
  }

  // Track whether the automatic evaluation would have agreed; a route
  // past unmet conditions is recorded as a skipped step.
  let automatic = evaluate_chain(&dp.evaluation_conditions, snapshot);

  let mut label = format!(
    "manual override '{}' by {}",
    option.label, selection.decided_by
  );
  if let Some(justification) = selection.justification.as_deref().filter(|j| !j.is_empty()) {
    label.push_str(&format!(" ({justification})"));
  }

  debug!(
    step_id = %step.step_id,
    option_id = %option.option_id,
    decided_by = %selection.decided_by,
    "manual_override_applied"
  );

  Ok(ResolvedTransition {
    decision: target_decision(&option.target),
    actions: Vec::new(),
    label,
    step_failed: false,
    step_skipped: !automatic,
  })
}

fn target_decision(target: &PathTarget) -> TransitionDecision {
  match target {
    PathTarget::NextStep { step_id } => TransitionDecision::Advance {
      next_step_id: step_id.clone(),
    },
    PathTarget::AlternativeTemplate { template_id } => TransitionDecision::Alternative {
      template_id: template_id.clone(),
    },
  }
}

//! Alternative-workflow transitions.
//!
//! Migrates a running instance onto a different protocol template. Data
//! carryover fails closed: only the fields a rule names in
//! `preserve_data` survive into the new instance's context, and a field
//! also named in `reset_data` is cleared even then. The old instance is
//! cancelled with a cross-reference, never deleted.

use std::sync::Arc;

use chrono::Utc;
use herdflow_protocol::AlternativeRule;
use herdflow_registry::TemplateRegistry;
use herdflow_store::{
  AlternativeAssignment, AssignmentStatus, InstanceStatus, Json, Store, TimelineKind,
  TriggerReason, WorkflowInstance,
};
use tracing::info;

use crate::audit::timeline_entry;
use crate::error::EngineError;

/// Outcome of an alternative-workflow transition.
#[derive(Debug)]
pub struct TransitionOutcome {
  pub assignment: AlternativeAssignment,
  /// Present once the transition is applied; `None` while it awaits
  /// approval.
  pub new_instance: Option<WorkflowInstance>,
}

/// Applies alternative-workflow rules to running instances.
pub struct AlternativeWorkflowTransitioner<S> {
  registry: Arc<TemplateRegistry>,
  store: Arc<S>,
}

impl<S> AlternativeWorkflowTransitioner<S>
where
  S: Store + Send + Sync,
  S::Error: std::error::Error + Send + Sync + 'static,
{
  pub fn new(registry: Arc<TemplateRegistry>, store: Arc<S>) -> Self {
    Self { registry, store }
  }

  /// Branch `instance` to the rule's target template.
  ///
  /// Without approval required the swap happens immediately; otherwise
  /// the assignment is staged and the instance blocks until a reviewer
  /// decides.
  pub async fn transition(
    &self,
    instance: &mut WorkflowInstance,
    rule: &AlternativeRule,
    reason: TriggerReason,
    trigger_label: &str,
  ) -> Result<TransitionOutcome, EngineError> {
    let mut assignment = AlternativeAssignment {
      assignment_id: uuid::Uuid::new_v4().to_string(),
      instance_id: instance.instance_id.clone(),
      step_id: instance.current_step_id.clone(),
      trigger_reason: reason,
      target_template_id: rule.target_template_id.clone(),
      preserved: Json(rule.preserve_data.clone()),
      reset: Json(rule.reset_data.clone()),
      requires_approval: rule.requires_approval,
      approved_by: None,
      approved_at: None,
      status: AssignmentStatus::PendingApproval,
      new_instance_id: None,
      created_at: Utc::now(),
    };

    if rule.requires_approval {
      instance.block_reason = Some(format!(
        "transition to template '{}' awaits approval ({trigger_label})",
        rule.target_template_id
      ));
      instance.updated_at = Utc::now();
      self
        .store
        .update_instance(instance)
        .await
        .map_err(EngineError::store)?;
      self
        .store
        .create_assignment(&assignment)
        .await
        .map_err(EngineError::store)?;
      self
        .store
        .append_timeline(&timeline_entry(
          &instance.instance_id,
          Some(&instance.current_step_id),
          TimelineKind::Blocked,
          format!(
            "alternative transition to '{}' staged for approval: {trigger_label}",
            rule.target_template_id
          ),
        ))
        .await
        .map_err(EngineError::store)?;

      info!(
        instance_id = %instance.instance_id,
        target_template = %rule.target_template_id,
        assignment_id = %assignment.assignment_id,
        "alternative_transition_staged"
      );

      return Ok(TransitionOutcome {
        assignment,
        new_instance: None,
      });
    }

    let new_instance = self.apply(&mut assignment, instance, trigger_label).await?;
    self
      .store
      .create_assignment(&assignment)
      .await
      .map_err(EngineError::store)?;

    Ok(TransitionOutcome {
      assignment,
      new_instance: Some(new_instance),
    })
  }

  /// Approve a staged transition and perform the swap.
  pub async fn approve(
    &self,
    assignment_id: &str,
    approver: &str,
  ) -> Result<TransitionOutcome, EngineError> {
    let mut assignment = self
      .store
      .get_assignment(assignment_id)
      .await
      .map_err(EngineError::store)?;
    if assignment.status != AssignmentStatus::PendingApproval || !assignment.requires_approval {
      return Err(EngineError::AssignmentNotPending {
        assignment_id: assignment_id.to_string(),
      });
    }

    let mut instance = self
      .store
      .get_instance(&assignment.instance_id)
      .await
      .map_err(EngineError::store)?;

    assignment.approved_by = Some(approver.to_string());
    assignment.approved_at = Some(Utc::now());

    let label = format!("approved by {approver}");
    let new_instance = self.apply(&mut assignment, &mut instance, &label).await?;
    self
      .store
      .update_assignment(&assignment)
      .await
      .map_err(EngineError::store)?;

    Ok(TransitionOutcome {
      assignment,
      new_instance: Some(new_instance),
    })
  }

  /// Reject a staged transition and unblock the originating instance.
  pub async fn reject(
    &self,
    assignment_id: &str,
    reviewer: &str,
  ) -> Result<AlternativeAssignment, EngineError> {
    let mut assignment = self
      .store
      .get_assignment(assignment_id)
      .await
      .map_err(EngineError::store)?;
    if assignment.status != AssignmentStatus::PendingApproval || !assignment.requires_approval {
      return Err(EngineError::AssignmentNotPending {
        assignment_id: assignment_id.to_string(),
      });
    }

    let mut instance = self
      .store
      .get_instance(&assignment.instance_id)
      .await
      .map_err(EngineError::store)?;
    instance.block_reason = None;
    instance.updated_at = Utc::now();
    self
      .store
      .update_instance(&instance)
      .await
      .map_err(EngineError::store)?;

    assignment.status = AssignmentStatus::Rejected;
    assignment.approved_by = Some(reviewer.to_string());
    assignment.approved_at = Some(Utc::now());
    self
      .store
      .update_assignment(&assignment)
      .await
      .map_err(EngineError::store)?;

    self
      .store
      .append_timeline(&timeline_entry(
        &instance.instance_id,
        Some(&instance.current_step_id),
        TimelineKind::Note,
        format!(
          "alternative transition to '{}' rejected by {reviewer}",
          assignment.target_template_id
        ),
      ))
      .await
      .map_err(EngineError::store)?;

    Ok(assignment)
  }

  /// Perform the swap: create the new instance, cancel the old one.
  async fn apply(
    &self,
    assignment: &mut AlternativeAssignment,
    instance: &mut WorkflowInstance,
    trigger_label: &str,
  ) -> Result<WorkflowInstance, EngineError> {
    let template = self.registry.get(&assignment.target_template_id)?;

    // The old instance is about to be cancelled; any other live instance
    // in the target category still collides.
    if let Some(existing) = self
      .store
      .active_in_category(&instance.subject_id, template.category)
      .await
      .map_err(EngineError::store)?
      && existing.instance_id != instance.instance_id
    {
      return Err(EngineError::AlreadyAssigned {
        subject_id: instance.subject_id.clone(),
        category: template.category.to_string(),
      });
    }

    let context = carry_over(&instance.context.0, &assignment.preserved.0, &assignment.reset.0);
    let now = Utc::now();

    let new_instance = WorkflowInstance {
      instance_id: uuid::Uuid::new_v4().to_string(),
      subject_id: instance.subject_id.clone(),
      template_id: template.template_id.clone(),
      template_version: template.version,
      category: Json(template.category),
      current_step_id: template.starting_step.clone(),
      status: InstanceStatus::Active,
      block_reason: None,
      completed_steps: Json(Vec::new()),
      failed_steps: Json(Vec::new()),
      skipped_steps: Json(Vec::new()),
      retry_counters: Json(Default::default()),
      context: Json(context),
      priority: Json(template.priority),
      owner: instance.owner.clone(),
      notes: Json(vec![format!(
        "branched from instance {} at step '{}'",
        instance.instance_id, instance.current_step_id
      )]),
      started_at: now,
      updated_at: now,
      completed_at: None,
      superseded_by: None,
    };

    self
      .store
      .create_instance(&new_instance)
      .await
      .map_err(EngineError::store)?;
    self
      .store
      .append_timeline(&timeline_entry(
        &new_instance.instance_id,
        Some(&new_instance.current_step_id),
        TimelineKind::Assigned,
        format!(
          "created by alternative transition from instance {} ({trigger_label})",
          instance.instance_id
        ),
      ))
      .await
      .map_err(EngineError::store)?;

    // Abandoned mid-protocol: the interrupted step counts as failed.
    if !instance.failed_steps.0.contains(&instance.current_step_id) {
      instance.failed_steps.0.push(instance.current_step_id.clone());
    }
    instance.status = InstanceStatus::Cancelled;
    instance.block_reason = None;
    instance.superseded_by = Some(new_instance.instance_id.clone());
    instance.completed_at = Some(now);
    instance.updated_at = now;
    self
      .store
      .update_instance(instance)
      .await
      .map_err(EngineError::store)?;
    self
      .store
      .append_timeline(&timeline_entry(
        &instance.instance_id,
        Some(&instance.current_step_id),
        TimelineKind::StatusChange,
        format!(
          "cancelled in favor of instance {} on template '{}' ({trigger_label})",
          new_instance.instance_id, template.template_id
        ),
      ))
      .await
      .map_err(EngineError::store)?;

    assignment.status = AssignmentStatus::Applied;
    assignment.new_instance_id = Some(new_instance.instance_id.clone());

    info!(
      old_instance = %instance.instance_id,
      new_instance = %new_instance.instance_id,
      template_id = %template.template_id,
      "alternative_transition_applied"
    );

    Ok(new_instance)
  }
}

/// Build the new instance's context from the old one.
///
/// Only `preserve` paths are copied; `reset` clears even a preserved
/// path; everything else starts empty.
fn carry_over(
  context: &serde_json::Value,
  preserve: &[String],
  reset: &[String],
) -> serde_json::Value {
  let mut result = serde_json::Value::Object(serde_json::Map::new());
  for path in preserve {
    if let Some(value) = get_path(context, path) {
      set_path(&mut result, path, value.clone());
    }
  }
  for path in reset {
    remove_path(&mut result, path);
  }
  result
}

fn get_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
  let mut current = value;
  for segment in path.split('.') {
    current = current.as_object()?.get(segment)?;
  }
  if current.is_null() { None } else { Some(current) }
}

fn set_path(target: &mut serde_json::Value, path: &str, value: serde_json::Value) {
  let mut current = target;
  let segments: Vec<&str> = path.split('.').collect();
  for (i, segment) in segments.iter().enumerate() {
    let map = match current {
      serde_json::Value::Object(map) => map,
      _ => return,
    };
    if i == segments.len() - 1 {
      map.insert(segment.to_string(), value);
      return;
    }
    current = map
      .entry(segment.to_string())
      .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
  }
}

fn remove_path(target: &mut serde_json::Value, path: &str) {
  let mut current = target;
  let segments: Vec<&str> = path.split('.').collect();
  for (i, segment) in segments.iter().enumerate() {
    let Some(map) = current.as_object_mut() else {
      return;
    };
    if i == segments.len() - 1 {
      map.remove(*segment);
      return;
    }
    match map.get_mut(*segment) {
      Some(next) => current = next,
      None => return,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::{carry_over, get_path};

  #[test]
  fn carry_over_preserves_exactly_the_listed_fields() {
    let context = json!({
      "baseline_exam_id": "exam-42",
      "stimulation": { "day": 6, "dose_ml": 3.0 },
      "batch_notes": "spring group",
    });

    let carried = carry_over(
      &context,
      &["baseline_exam_id".to_string(), "stimulation.day".to_string()],
      &["stimulation.dose_ml".to_string()],
    );

    assert_eq!(carried["baseline_exam_id"], "exam-42");
    assert_eq!(carried["stimulation"]["day"], 6);
    // Unlisted fields default to cleared.
    assert!(carried.get("batch_notes").is_none());
    assert!(get_path(&carried, "stimulation.dose_ml").is_none());
  }

  #[test]
  fn reset_wins_over_preserve() {
    let context = json!({ "shared": "value" });
    let carried = carry_over(
      &context,
      &["shared".to_string()],
      &["shared".to_string()],
    );
    assert!(carried.get("shared").is_none());
  }

  #[test]
  fn missing_preserve_paths_are_ignored() {
    let context = json!({ "a": 1 });
    let carried = carry_over(&context, &["b.c".to_string()], &[]);
    assert_eq!(carried, json!({}));
  }
}

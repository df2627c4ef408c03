//! Instance status views for dashboards.

use herdflow_protocol::{ModuleKind, Step};
use herdflow_store::{EscalationRecord, InstanceStatus, Store, WorkflowInstance};
use serde::Serialize;

use crate::error::EngineError;
use crate::manager::WorkflowInstanceManager;

/// Preview of the action a step will dispatch next. Advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct NextActionView {
  pub action_id: String,
  pub module: ModuleKind,
  pub summary: String,
}

/// Dashboard view of one instance.
#[derive(Debug, Serialize)]
pub struct InstanceStatusView {
  pub instance_id: String,
  pub subject_id: String,
  pub template_id: String,
  pub current_step_id: String,
  pub current_step_name: String,
  pub status: InstanceStatus,
  pub block_reason: Option<String>,
  /// `completed_steps / total_steps`, in percent.
  pub progress_percentage: f64,
  pub next_scheduled_action: Option<NextActionView>,
  /// Escalations nobody has acknowledged yet.
  pub open_escalations: Vec<EscalationRecord>,
}

impl<S> WorkflowInstanceManager<S>
where
  S: Store + Send + Sync,
  S::Error: std::error::Error + Send + Sync + 'static,
{
  /// Build the dashboard view for an instance.
  pub async fn status(&self, instance_id: &str) -> Result<InstanceStatusView, EngineError> {
    let instance = self
      .store()
      .get_instance(instance_id)
      .await
      .map_err(EngineError::store)?;
    let template = self
      .registry()
      .get_version(&instance.template_id, instance.template_version)?;
    let step = template.step(&instance.current_step_id);

    let escalations = self
      .store()
      .list_escalations(instance_id)
      .await
      .map_err(EngineError::store)?;
    let open_escalations = escalations
      .into_iter()
      .filter(|e| e.acknowledged_at.is_none())
      .collect();

    let progress_percentage = if template.total_steps() == 0 {
      0.0
    } else {
      (instance.completed_steps.0.len() as f64 / template.total_steps() as f64) * 100.0
    };

    Ok(InstanceStatusView {
      instance_id: instance.instance_id.clone(),
      subject_id: instance.subject_id.clone(),
      template_id: instance.template_id.clone(),
      current_step_id: instance.current_step_id.clone(),
      current_step_name: step.map(|s| s.name.clone()).unwrap_or_default(),
      status: instance.status,
      block_reason: instance.block_reason.clone(),
      progress_percentage,
      next_scheduled_action: step.and_then(|s| next_action(&instance, s)),
      open_escalations,
    })
  }
}

fn next_action(instance: &WorkflowInstance, step: &Step) -> Option<NextActionView> {
  if instance.status.is_terminal() {
    return None;
  }
  let action = step
    .on_entry_actions
    .first()
    .or_else(|| step.exit_paths.first().and_then(|p| p.actions.first()))?;
  Some(NextActionView {
    action_id: action.action_id.clone(),
    module: action.target_module,
    summary: action.params.kind().to_string(),
  })
}

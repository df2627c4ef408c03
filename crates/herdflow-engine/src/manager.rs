//! Workflow instance lifecycle.
//!
//! The manager is the only writer of instance state. `advance` is the
//! core transition: serialized per instance, it resolves the route out of
//! the current step against a fresh snapshot, settles the chosen path's
//! actions, and commits the step move only once every blocking action
//! reached a terminal state. Different subjects advance fully in
//! parallel; a second trigger for the same instance queues on the
//! per-instance lock and re-evaluates against the committed state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use futures::future::join_all;
use herdflow_modules::{ModuleRegistry, SnapshotProvider};
use herdflow_protocol::{
  Action, ActionParams, ActionPriority, AlternativeRule, CheckSeverity, FailurePolicy,
  ModuleKind, Priority, ProtocolTemplate, Snapshot, Step, Urgency,
};
use herdflow_registry::TemplateRegistry;
use herdflow_store::{
  EscalationRecord, InstanceStatus, Json, Store, TimelineKind, TriggerReason, WorkflowInstance,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::EngineConfig;
use crate::audit::timeline_entry;
use crate::dispatcher::{ActionDispatcher, ActionResult, DispatchContext};
use crate::error::EngineError;
use crate::resolver::{ManualSelection, ResolvedTransition, TransitionDecision, resolve_next};
use crate::retry::{RetryEscalationPolicy, SettledAction};
use crate::transitioner::{AlternativeWorkflowTransitioner, TransitionOutcome};

/// External event driving an instance forward.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
  ExamCompleted,
  InjectionGiven,
  ProcedureDone,
  TimerElapsed,
  ManualOverride {
    option_id: String,
    justification: Option<String>,
    decided_by: String,
  },
}

impl TriggerEvent {
  pub fn label(&self) -> &'static str {
    match self {
      TriggerEvent::ExamCompleted => "exam_completed",
      TriggerEvent::InjectionGiven => "injection_given",
      TriggerEvent::ProcedureDone => "procedure_done",
      TriggerEvent::TimerElapsed => "timer_elapsed",
      TriggerEvent::ManualOverride { .. } => "manual_override",
    }
  }

  fn manual_selection(&self) -> Option<ManualSelection> {
    match self {
      TriggerEvent::ManualOverride {
        option_id,
        justification,
        decided_by,
      } => Some(ManualSelection {
        option_id: option_id.clone(),
        justification: justification.clone(),
        decided_by: decided_by.clone(),
      }),
      _ => None,
    }
  }
}

/// Assignment parameters supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct AssignOptions {
  pub start_date: Option<chrono::DateTime<Utc>>,
  pub owner: Option<String>,
  pub priority: Option<Priority>,
  pub reasoning: Option<String>,
  pub notes: Vec<String>,
}

/// A subject an assignment could not create an instance for.
#[derive(Debug, Clone)]
pub struct RejectedSubject {
  pub subject_id: String,
  pub reason: String,
}

/// Per-subject result of a bulk assignment.
#[derive(Debug)]
pub struct AssignmentReport {
  pub created: Vec<WorkflowInstance>,
  pub rejected: Vec<RejectedSubject>,
}

/// Owns every mutation of [`WorkflowInstance`] state.
pub struct WorkflowInstanceManager<S> {
  registry: Arc<TemplateRegistry>,
  store: Arc<S>,
  snapshots: Arc<dyn SnapshotProvider>,
  dispatcher: ActionDispatcher,
  policy: RetryEscalationPolicy,
  transitioner: AlternativeWorkflowTransitioner<S>,
  locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  cancellations: StdMutex<HashMap<String, CancellationToken>>,
}

impl<S> WorkflowInstanceManager<S>
where
  S: Store + Send + Sync,
  S::Error: std::error::Error + Send + Sync + 'static,
{
  pub fn new(
    registry: Arc<TemplateRegistry>,
    store: Arc<S>,
    snapshots: Arc<dyn SnapshotProvider>,
    modules: ModuleRegistry,
    config: EngineConfig,
  ) -> Self {
    let dispatcher = ActionDispatcher::new(modules, config.dispatch_timeout);
    let policy = RetryEscalationPolicy::new(dispatcher.clone(), config.retry_delay_unit);
    let transitioner = AlternativeWorkflowTransitioner::new(registry.clone(), store.clone());
    Self {
      registry,
      store,
      snapshots,
      dispatcher,
      policy,
      transitioner,
      locks: StdMutex::new(HashMap::new()),
      cancellations: StdMutex::new(HashMap::new()),
    }
  }

  /// Assign a template to a batch of subjects, one instance each.
  ///
  /// Partial failures are per-subject: a subject that already runs an
  /// instance in the template's category is reported, not fatal.
  #[instrument(name = "assign_template", skip(self, subject_ids, options), fields(template_id = %template_id))]
  pub async fn assign(
    &self,
    template_id: &str,
    subject_ids: &[String],
    options: AssignOptions,
  ) -> Result<AssignmentReport, EngineError> {
    let template = self.registry.get(template_id)?;
    let mut created = Vec::new();
    let mut rejected = Vec::new();

    for subject_id in subject_ids {
      match self.assign_one(&template, subject_id, &options).await {
        Ok(instance) => created.push(instance),
        Err(e) => {
          warn!(subject_id = %subject_id, error = %e, "assignment_rejected");
          rejected.push(RejectedSubject {
            subject_id: subject_id.clone(),
            reason: e.to_string(),
          });
        }
      }
    }

    info!(
      created = created.len(),
      rejected = rejected.len(),
      "bulk_assignment_done"
    );
    Ok(AssignmentReport { created, rejected })
  }

  async fn assign_one(
    &self,
    template: &Arc<ProtocolTemplate>,
    subject_id: &str,
    options: &AssignOptions,
  ) -> Result<WorkflowInstance, EngineError> {
    if self
      .store
      .active_in_category(subject_id, template.category)
      .await
      .map_err(EngineError::store)?
      .is_some()
    {
      return Err(EngineError::AlreadyAssigned {
        subject_id: subject_id.to_string(),
        category: template.category.to_string(),
      });
    }

    let now = Utc::now();
    let mut notes = options.notes.clone();
    if let Some(reasoning) = &options.reasoning {
      notes.insert(0, reasoning.clone());
    }

    let mut instance = WorkflowInstance {
      instance_id: uuid::Uuid::new_v4().to_string(),
      subject_id: subject_id.to_string(),
      template_id: template.template_id.clone(),
      template_version: template.version,
      category: Json(template.category),
      current_step_id: template.starting_step.clone(),
      status: InstanceStatus::Active,
      block_reason: None,
      completed_steps: Json(Vec::new()),
      failed_steps: Json(Vec::new()),
      skipped_steps: Json(Vec::new()),
      retry_counters: Json(HashMap::new()),
      context: Json(serde_json::Value::Object(serde_json::Map::new())),
      priority: Json(options.priority.unwrap_or(template.priority)),
      owner: options.owner.clone(),
      notes: Json(notes),
      started_at: options.start_date.unwrap_or(now),
      updated_at: now,
      completed_at: None,
      superseded_by: None,
    };

    self
      .store
      .create_instance(&instance)
      .await
      .map_err(EngineError::store)?;
    self
      .store
      .append_timeline(&timeline_entry(
        &instance.instance_id,
        Some(&instance.current_step_id),
        TimelineKind::Assigned,
        format!(
          "assigned template '{}' v{} starting at step '{}'",
          template.template_id, template.version, template.starting_step
        ),
      ))
      .await
      .map_err(EngineError::store)?;

    info!(
      instance_id = %instance.instance_id,
      subject_id = %subject_id,
      template_id = %template.template_id,
      "instance_assigned"
    );

    if template.auto_start
      && let Some(step) = template.step(&template.starting_step)
    {
      self.run_entry_actions(&mut instance, step).await?;
    }

    Ok(instance)
  }

  /// Advance one instance in response to a trigger event.
  ///
  /// Transactional per instance: the step pointer moves only after every
  /// blocking action of the chosen path settled successfully. A blocked
  /// transition returns the instance with `block_reason` set rather than
  /// failing the call.
  #[instrument(name = "instance_advance", skip(self, trigger), fields(instance_id = %instance_id, trigger = trigger.label()))]
  pub async fn advance(
    &self,
    instance_id: &str,
    trigger: TriggerEvent,
  ) -> Result<WorkflowInstance, EngineError> {
    let lock = self.instance_lock(instance_id);
    let _guard = lock.lock().await;

    let mut instance = self
      .store
      .get_instance(instance_id)
      .await
      .map_err(EngineError::store)?;
    if instance.status != InstanceStatus::Active {
      return Err(EngineError::InvalidState {
        instance_id: instance_id.to_string(),
        status: instance.status,
        operation: "advance",
      });
    }

    let template = self
      .registry
      .get_version(&instance.template_id, instance.template_version)?;
    let step = template
      .step(&instance.current_step_id)
      .ok_or_else(|| EngineError::StepNotFound {
        template_id: instance.template_id.clone(),
        step_id: instance.current_step_id.clone(),
      })?;

    let snapshot = self.snapshots.snapshot(&instance.subject_id).await?;
    let manual = trigger.manual_selection();
    let resolved = resolve_next(step, &snapshot, manual.as_ref())?;

    self
      .store
      .append_timeline(&timeline_entry(
        instance_id,
        Some(&step.step_id),
        TimelineKind::Decision,
        format!("{} (trigger: {})", resolved.label, trigger.label()),
      ))
      .await
      .map_err(EngineError::store)?;

    match &resolved.decision {
      TransitionDecision::Escalate {
        escalate_to,
        urgency,
        message,
      } => {
        self
          .raise_escalation(&mut instance, &step.step_id, None, escalate_to, *urgency, message)
          .await?;
        instance.block_reason = Some(format!("escalated to {escalate_to}: {message}"));
        self.persist(&mut instance).await?;
        Ok(instance)
      }

      TransitionDecision::ManualReview { reason } => {
        instance.block_reason = Some(reason.clone());
        self
          .store
          .append_timeline(&timeline_entry(
            instance_id,
            Some(&step.step_id),
            TimelineKind::Blocked,
            format!("manual review required: {reason}"),
          ))
          .await
          .map_err(EngineError::store)?;
        self.persist(&mut instance).await?;
        Ok(instance)
      }

      TransitionDecision::Advance { .. } | TransitionDecision::Alternative { .. } => {
        let ctx = self.dispatch_context(&instance);
        let cancel = self.cancel_token(instance_id);
        let settled = self.settle_all(&resolved.actions, &ctx, &cancel).await;
        let blocking = self
          .record_settled(&mut instance, &step.step_id, &settled)
          .await?;

        if cancel.is_cancelled() {
          // A concurrent cancel owns the status change; just persist the
          // bookkeeping and leave the step pointer alone.
          self
            .store
            .append_timeline(&timeline_entry(
              instance_id,
              Some(&step.step_id),
              TimelineKind::Note,
              "transition abandoned: instance was cancelled mid-advance",
            ))
            .await
            .map_err(EngineError::store)?;
          self.persist(&mut instance).await?;
          return Ok(instance);
        }

        if !blocking.is_empty() {
          instance.block_reason = Some(format!(
            "actions [{}] did not settle; instance stays at step '{}'",
            blocking.join(", "),
            step.step_id
          ));
          self
            .store
            .append_timeline(&timeline_entry(
              instance_id,
              Some(&step.step_id),
              TimelineKind::Blocked,
              instance.block_reason.clone().unwrap_or_default(),
            ))
            .await
            .map_err(EngineError::store)?;
          self.persist(&mut instance).await?;
          return Ok(instance);
        }

        if let Some(reason) = self.run_quality_checks(&mut instance, step, &snapshot).await? {
          instance.block_reason = Some(reason);
          self.persist(&mut instance).await?;
          return Ok(instance);
        }

        match &resolved.decision {
          TransitionDecision::Advance { next_step_id } => {
            self
              .commit_advance(&mut instance, &template, step, next_step_id, &resolved)
              .await?;
            Ok(instance)
          }
          TransitionDecision::Alternative { template_id } => {
            self
              .branch_to_alternative(instance, &template, template_id, &trigger, &resolved)
              .await
          }
          _ => unreachable!("outer match restricts the decision"),
        }
      }
    }
  }

  /// Pause an instance. Waits for an in-flight advance to drain, then
  /// blocks further transitions until resumed.
  pub async fn pause(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
    let lock = self.instance_lock(instance_id);
    let _guard = lock.lock().await;

    let mut instance = self
      .store
      .get_instance(instance_id)
      .await
      .map_err(EngineError::store)?;
    if instance.status != InstanceStatus::Active {
      return Err(EngineError::InvalidState {
        instance_id: instance_id.to_string(),
        status: instance.status,
        operation: "pause",
      });
    }

    instance.status = InstanceStatus::Paused;
    self
      .store
      .append_timeline(&timeline_entry(
        instance_id,
        Some(&instance.current_step_id),
        TimelineKind::StatusChange,
        "instance paused",
      ))
      .await
      .map_err(EngineError::store)?;
    self.persist(&mut instance).await?;
    Ok(instance)
  }

  /// Resume a paused instance.
  pub async fn resume(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
    let lock = self.instance_lock(instance_id);
    let _guard = lock.lock().await;

    let mut instance = self
      .store
      .get_instance(instance_id)
      .await
      .map_err(EngineError::store)?;
    if instance.status != InstanceStatus::Paused {
      return Err(EngineError::InvalidState {
        instance_id: instance_id.to_string(),
        status: instance.status,
        operation: "resume",
      });
    }

    instance.status = InstanceStatus::Active;
    self
      .store
      .append_timeline(&timeline_entry(
        instance_id,
        Some(&instance.current_step_id),
        TimelineKind::StatusChange,
        "instance resumed",
      ))
      .await
      .map_err(EngineError::store)?;
    self.persist(&mut instance).await?;
    Ok(instance)
  }

  /// Cancel an instance: pending retries stop, one cancellation
  /// notification goes out, and the record stays for audit.
  pub async fn cancel(
    &self,
    instance_id: &str,
    reason: Option<String>,
  ) -> Result<WorkflowInstance, EngineError> {
    // Flip the token before taking the lock so a settle sleeping inside
    // an in-flight advance wakes up and yields.
    self.cancel_token(instance_id).cancel();

    let lock = self.instance_lock(instance_id);
    let _guard = lock.lock().await;

    let mut instance = self
      .store
      .get_instance(instance_id)
      .await
      .map_err(EngineError::store)?;
    if instance.status.is_terminal() {
      return Err(EngineError::InvalidState {
        instance_id: instance_id.to_string(),
        status: instance.status,
        operation: "cancel",
      });
    }

    let detail = reason.unwrap_or_else(|| "cancelled by operator".to_string());
    instance.status = InstanceStatus::Cancelled;
    instance.block_reason = None;
    instance.completed_at = Some(Utc::now());
    self
      .store
      .append_timeline(&timeline_entry(
        instance_id,
        Some(&instance.current_step_id),
        TimelineKind::StatusChange,
        format!("instance cancelled: {detail}"),
      ))
      .await
      .map_err(EngineError::store)?;
    self.persist(&mut instance).await?;

    // A single notification for the whole cancellation, not one per
    // aborted action.
    let ctx = self.dispatch_context(&instance);
    let recipient = instance
      .owner
      .clone()
      .unwrap_or_else(|| "on-call-veterinarian".to_string());
    self
      .notify(
        &ctx,
        &recipient,
        format!(
          "protocol instance {} for subject {} was cancelled: {detail}",
          instance.instance_id, instance.subject_id
        ),
        Urgency::Routine,
      )
      .await;

    info!(instance_id = %instance_id, "instance_cancelled");
    Ok(instance)
  }

  /// Approve a staged alternative transition.
  pub async fn approve_alternative(
    &self,
    assignment_id: &str,
    approver: &str,
  ) -> Result<WorkflowInstance, EngineError> {
    let assignment = self
      .store
      .get_assignment(assignment_id)
      .await
      .map_err(EngineError::store)?;
    let lock = self.instance_lock(&assignment.instance_id);
    let _guard = lock.lock().await;

    let outcome = self.transitioner.approve(assignment_id, approver).await?;
    self.after_branch(outcome).await
  }

  /// Reject a staged alternative transition, unblocking the original
  /// instance at its current step.
  pub async fn reject_alternative(
    &self,
    assignment_id: &str,
    reviewer: &str,
  ) -> Result<WorkflowInstance, EngineError> {
    let assignment = self
      .store
      .get_assignment(assignment_id)
      .await
      .map_err(EngineError::store)?;
    let lock = self.instance_lock(&assignment.instance_id);
    let _guard = lock.lock().await;

    let assignment = self.transitioner.reject(assignment_id, reviewer).await?;
    self
      .store
      .get_instance(&assignment.instance_id)
      .await
      .map_err(EngineError::store)
  }

  async fn branch_to_alternative(
    &self,
    mut instance: WorkflowInstance,
    template: &Arc<ProtocolTemplate>,
    target_template_id: &str,
    trigger: &TriggerEvent,
    resolved: &ResolvedTransition,
  ) -> Result<WorkflowInstance, EngineError> {
    // An exit path may point at a template no rule describes; carryover
    // then fails closed with no approval gate.
    let rule = template
      .alternative_rule_for(target_template_id)
      .cloned()
      .unwrap_or_else(|| AlternativeRule {
        rule_id: format!("adhoc-{target_template_id}"),
        trigger_description: String::new(),
        target_template_id: target_template_id.to_string(),
        preserve_data: Vec::new(),
        reset_data: Vec::new(),
        requires_approval: false,
      });

    let reason = match trigger {
      TriggerEvent::ManualOverride { .. } => TriggerReason::ManualDecision,
      _ => TriggerReason::ConditionFailed,
    };

    let outcome = self
      .transitioner
      .transition(&mut instance, &rule, reason, &resolved.label)
      .await?;

    if outcome.new_instance.is_none() {
      // Staged for approval; the original instance stays, blocked.
      return Ok(instance);
    }
    self.after_branch(outcome).await
  }

  /// Run auto-start entry actions for a freshly created branch instance.
  async fn after_branch(
    &self,
    outcome: TransitionOutcome,
  ) -> Result<WorkflowInstance, EngineError> {
    let Some(mut new_instance) = outcome.new_instance else {
      return Err(EngineError::AssignmentNotPending {
        assignment_id: outcome.assignment.assignment_id,
      });
    };

    let template = self
      .registry
      .get_version(&new_instance.template_id, new_instance.template_version)?;
    if template.auto_start
      && let Some(step) = template.step(&new_instance.current_step_id)
    {
      self.run_entry_actions(&mut new_instance, step).await?;
    }
    Ok(new_instance)
  }

  async fn commit_advance(
    &self,
    instance: &mut WorkflowInstance,
    template: &Arc<ProtocolTemplate>,
    step: &Step,
    next_step_id: &str,
    resolved: &ResolvedTransition,
  ) -> Result<(), EngineError> {
    let entered = template
      .step(next_step_id)
      .ok_or_else(|| EngineError::StepNotFound {
        template_id: instance.template_id.clone(),
        step_id: next_step_id.to_string(),
      })?;

    let history = if resolved.step_failed {
      &mut instance.failed_steps.0
    } else if resolved.step_skipped {
      &mut instance.skipped_steps.0
    } else {
      &mut instance.completed_steps.0
    };
    history.push(step.step_id.clone());

    instance.current_step_id = next_step_id.to_string();
    instance.block_reason = None;

    self
      .store
      .append_timeline(&timeline_entry(
        &instance.instance_id,
        Some(&step.step_id),
        TimelineKind::Transition,
        format!(
          "advanced from '{}' to '{}': {}",
          step.name, entered.name, resolved.label
        ),
      ))
      .await
      .map_err(EngineError::store)?;

    if entered.terminal {
      instance.completed_steps.0.push(entered.step_id.clone());
      instance.status = InstanceStatus::Completed;
      instance.completed_at = Some(Utc::now());
      self
        .store
        .append_timeline(&timeline_entry(
          &instance.instance_id,
          Some(&entered.step_id),
          TimelineKind::StatusChange,
          format!("protocol completed at step '{}'", entered.name),
        ))
        .await
        .map_err(EngineError::store)?;
      info!(
        instance_id = %instance.instance_id,
        step_id = %entered.step_id,
        "instance_completed"
      );
    } else {
      info!(
        instance_id = %instance.instance_id,
        from = %step.step_id,
        to = %entered.step_id,
        "transition_committed"
      );
    }

    self.persist(instance).await?;

    // Entry actions settle after the commit; an escalation here blocks
    // future transitions but never rolls back the committed move.
    self.run_entry_actions(instance, entered).await
  }

  async fn run_entry_actions(
    &self,
    instance: &mut WorkflowInstance,
    step: &Step,
  ) -> Result<(), EngineError> {
    if step.on_entry_actions.is_empty() {
      return Ok(());
    }

    let ctx = self.dispatch_context(instance);
    let cancel = self.cancel_token(&instance.instance_id);
    let settled = self
      .settle_all(&step.on_entry_actions, &ctx, &cancel)
      .await;
    let blocking = self
      .record_settled(instance, &step.step_id, &settled)
      .await?;

    if !blocking.is_empty() && instance.status == InstanceStatus::Active {
      instance.block_reason = Some(format!(
        "entry actions [{}] of step '{}' escalated",
        blocking.join(", "),
        step.step_id
      ));
      self
        .store
        .append_timeline(&timeline_entry(
          &instance.instance_id,
          Some(&step.step_id),
          TimelineKind::Blocked,
          instance.block_reason.clone().unwrap_or_default(),
        ))
        .await
        .map_err(EngineError::store)?;
    }

    self.persist(instance).await
  }

  /// Settle a path's actions concurrently. One failing action never
  /// aborts its siblings; each runs to its own terminal state.
  async fn settle_all(
    &self,
    actions: &[Action],
    ctx: &DispatchContext,
    cancel: &CancellationToken,
  ) -> Vec<SettledAction> {
    join_all(
      actions
        .iter()
        .map(|action| self.policy.settle(action, ctx, cancel)),
    )
    .await
  }

  /// Persist retry counters and escalation records for settled actions.
  /// Returns the ids of actions that block the commit.
  async fn record_settled(
    &self,
    instance: &mut WorkflowInstance,
    step_id: &str,
    settled: &[SettledAction],
  ) -> Result<Vec<String>, EngineError> {
    let mut blocking = Vec::new();

    for action in settled {
      instance
        .retry_counters
        .0
        .insert(action.action_id.clone(), action.attempts);

      if let Some(notice) = &action.escalation {
        self
          .raise_escalation(
            instance,
            step_id,
            Some(&notice.action_id),
            &notice.escalate_to,
            notice.urgency,
            &notice.message,
          )
          .await?;
      }

      if action.blocks_commit() {
        blocking.push(action.action_id.clone());
      }
    }

    Ok(blocking)
  }

  /// Evaluate the step's quality checks after its actions settled.
  ///
  /// Failing `error`/`critical` checks block the transition and escalate;
  /// `warning` checks land in the timeline and proceed.
  async fn run_quality_checks(
    &self,
    instance: &mut WorkflowInstance,
    step: &Step,
    snapshot: &Snapshot,
  ) -> Result<Option<String>, EngineError> {
    let mut blockers: Vec<&str> = Vec::new();
    let mut worst = CheckSeverity::Warning;

    for check in &step.quality_checks {
      if crate::evaluator::evaluate(&check.condition, snapshot) {
        continue;
      }
      match check.severity {
        CheckSeverity::Warning => {
          warn!(
            instance_id = %instance.instance_id,
            check = %check.name,
            "quality_check_warning"
          );
          self
            .store
            .append_timeline(&timeline_entry(
              &instance.instance_id,
              Some(&step.step_id),
              TimelineKind::Note,
              format!("quality check '{}' warned but does not block", check.name),
            ))
            .await
            .map_err(EngineError::store)?;
        }
        severity => {
          worst = worst.max(severity);
          blockers.push(&check.name);
        }
      }
    }

    if blockers.is_empty() {
      return Ok(None);
    }

    let urgency = match worst {
      CheckSeverity::Critical => Urgency::Emergency,
      _ => Urgency::Urgent,
    };
    let escalate_to = instance
      .owner
      .clone()
      .unwrap_or_else(|| "on-call-veterinarian".to_string());
    let message = format!("quality checks failed: {}", blockers.join(", "));

    self
      .raise_escalation(instance, &step.step_id, None, &escalate_to, urgency, &message)
      .await?;

    Ok(Some(message))
  }

  /// Persist an escalation record, log it in the timeline, and notify.
  async fn raise_escalation(
    &self,
    instance: &mut WorkflowInstance,
    step_id: &str,
    action_id: Option<&str>,
    escalate_to: &str,
    urgency: Urgency,
    message: &str,
  ) -> Result<(), EngineError> {
    let record = EscalationRecord {
      escalation_id: uuid::Uuid::new_v4().to_string(),
      instance_id: instance.instance_id.clone(),
      step_id: Some(step_id.to_string()),
      action_id: action_id.map(str::to_string),
      message: message.to_string(),
      escalate_to: escalate_to.to_string(),
      urgency: Json(urgency),
      raised_at: Utc::now(),
      acknowledged_at: None,
    };
    self
      .store
      .create_escalation(&record)
      .await
      .map_err(EngineError::store)?;
    self
      .store
      .append_timeline(&timeline_entry(
        &instance.instance_id,
        Some(step_id),
        TimelineKind::Escalation,
        format!("escalated to {escalate_to}: {message}"),
      ))
      .await
      .map_err(EngineError::store)?;

    // Action escalations already notified inside the retry policy.
    if action_id.is_none() {
      let ctx = self.dispatch_context(instance);
      self.notify(&ctx, escalate_to, message.to_string(), urgency).await;
    }

    Ok(())
  }

  /// Best-effort notification; the persisted escalation record is the
  /// durable signal.
  async fn notify(&self, ctx: &DispatchContext, recipient: &str, message: String, urgency: Urgency) {
    let action = Action {
      action_id: uuid::Uuid::new_v4().to_string(),
      params: ActionParams::Notify {
        recipient: recipient.to_string(),
        message,
        urgency,
      },
      target_module: ModuleKind::Notification,
      priority: ActionPriority::Urgent,
      delay: None,
      failure_policy: FailurePolicy {
        retry_attempts: 0,
        retry_delay_hours: 0,
        escalation_message: String::new(),
        notify_veterinarian: false,
        accept_partial_failure: true,
        fallback_action: None,
      },
    };
    if let ActionResult::Failure { detail } = self.dispatcher.dispatch(&action, ctx, 1).await {
      error!(
        instance_id = %ctx.instance_id,
        error = %detail,
        "notification_dispatch_failed"
      );
    }
  }

  async fn persist(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
    instance.updated_at = Utc::now();
    self
      .store
      .update_instance(instance)
      .await
      .map_err(EngineError::store)
  }

  pub(crate) fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub(crate) fn registry(&self) -> &Arc<TemplateRegistry> {
    &self.registry
  }

  fn dispatch_context(&self, instance: &WorkflowInstance) -> DispatchContext {
    DispatchContext {
      instance_id: instance.instance_id.clone(),
      subject_id: instance.subject_id.clone(),
      owner: instance.owner.clone(),
    }
  }

  fn instance_lock(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
      .entry(instance_id.to_string())
      .or_default()
      .clone()
  }

  fn cancel_token(&self, instance_id: &str) -> CancellationToken {
    let mut cancellations = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
    cancellations
      .entry(instance_id.to_string())
      .or_default()
      .clone()
  }
}

//! End-to-end engine tests: registered templates, a SQLite store, and
//! recording module adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herdflow_engine::{
  AssignOptions, EngineConfig, EngineError, TriggerEvent, WorkflowInstanceManager,
};
use herdflow_modules::{ModuleRegistry, RecordingAdapter, StaticSnapshots};
use herdflow_protocol::{
  Action, ActionDelay, ActionParams, ActionPriority, AlternativeRule, CheckSeverity, CompareOp,
  Condition, DecisionOutcome, DecisionPoint, ExitPath, FailurePolicy, FieldRef, FieldValue,
  InjectionRoute, LogicalOperator, ManualOption, ModuleKind, OutcomeKind, PathTarget, Priority,
  ProtocolTemplate, QualityCheck, Snapshot, Step, StepType, TemplateCategory,
};
use herdflow_registry::TemplateRegistry;
use herdflow_store::{AssignmentStatus, InstanceStatus, SqliteStore, Store};
use sqlx::sqlite::SqlitePoolOptions;

struct Harness {
  manager: WorkflowInstanceManager<SqliteStore>,
  store: Arc<SqliteStore>,
  registry: Arc<TemplateRegistry>,
  snapshots: Arc<StaticSnapshots>,
  ultrasound: Arc<RecordingAdapter>,
  injection: Arc<RecordingAdapter>,
  notification: Arc<RecordingAdapter>,
}

async fn harness_with(injection: Arc<RecordingAdapter>) -> Harness {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .expect("failed to open in-memory sqlite");
  let store = Arc::new(SqliteStore::new(pool));
  store.migrate().await.expect("migrations failed");

  let registry = Arc::new(TemplateRegistry::new());
  let snapshots = Arc::new(StaticSnapshots::new());
  let ultrasound = RecordingAdapter::new();
  let notification = RecordingAdapter::new();

  let modules = ModuleRegistry::new()
    .with_adapter(ModuleKind::Ultrasound, ultrasound.clone())
    .with_adapter(ModuleKind::Injection, injection.clone())
    .with_adapter(ModuleKind::Notification, notification.clone());

  let config = EngineConfig {
    dispatch_timeout: Duration::from_secs(1),
    retry_delay_unit: Duration::from_millis(1),
  };
  let manager = WorkflowInstanceManager::new(
    registry.clone(),
    store.clone(),
    snapshots.clone(),
    modules,
    config,
  );

  Harness {
    manager,
    store,
    registry,
    snapshots,
    ultrasound,
    injection,
    notification,
  }
}

async fn harness() -> Harness {
  harness_with(RecordingAdapter::new()).await
}

fn condition(field: &str, operator: CompareOp, value: FieldValue) -> Condition {
  Condition {
    condition_id: format!("c-{field}"),
    field: FieldRef::new(field),
    operator,
    value,
    tolerance: None,
    unit: None,
    time_constraint: None,
    skip_if_missing: false,
    logical_operator: None,
  }
}

fn ready_conditions() -> Vec<Condition> {
  let mut healthy = condition(
    "uterine_status",
    CompareOp::Eq,
    FieldValue::Text("healthy".into()),
  );
  healthy.logical_operator = Some(LogicalOperator::And);
  vec![
    condition("follicle_count", CompareOp::Gte, FieldValue::Number(3.0)),
    healthy,
  ]
}

fn exam_action(id: &str) -> Action {
  Action {
    action_id: id.to_string(),
    params: ActionParams::ScheduleExam {
      exam_type: "follicle_monitoring".to_string(),
      assigned_vet: None,
      room: Some("ultrasound-1".to_string()),
      notes: None,
    },
    target_module: ModuleKind::Ultrasound,
    priority: ActionPriority::Normal,
    delay: Some(ActionDelay {
      days: Some(2),
      hours: None,
    }),
    failure_policy: FailurePolicy::default(),
  }
}

fn injection_action(id: &str, retries: u32) -> Action {
  Action {
    action_id: id.to_string(),
    params: ActionParams::ScheduleInjection {
      medication: "FSH".to_string(),
      dosage: "3ml".to_string(),
      route: Some(InjectionRoute::Im),
      notes: None,
    },
    target_module: ModuleKind::Injection,
    priority: ActionPriority::High,
    delay: None,
    failure_policy: FailurePolicy {
      retry_attempts: retries,
      retry_delay_hours: 1,
      escalation_message: "FSH scheduling failed repeatedly".to_string(),
      notify_veterinarian: true,
      accept_partial_failure: false,
      fallback_action: None,
    },
  }
}

fn terminal_step(id: &str) -> Step {
  Step {
    step_id: id.to_string(),
    name: id.replace('-', " "),
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

/// Baseline exam -> stimulation -> done, with a success path gated on
/// follicle count and uterine status.
fn donor_template() -> ProtocolTemplate {
  let baseline = Step {
    step_id: "baseline-exam".to_string(),
    name: "baseline exam".to_string(),
    description: "initial ultrasound before stimulation".to_string(),
    step_type: StepType::Exam,
    on_entry_actions: Vec::new(),
    decision_point: None,
    exit_paths: vec![
      ExitPath {
        path_id: "ready".to_string(),
        name: "ready for stimulation".to_string(),
        conditions: ready_conditions(),
        actions: vec![injection_action("start-fsh", 2), exam_action("recheck-exam")],
        target: PathTarget::NextStep {
          step_id: "stimulation".to_string(),
        },
        probability: Some(70.0),
      },
      ExitPath {
        path_id: "hold".to_string(),
        name: "hold and recheck".to_string(),
        conditions: Vec::new(),
        actions: vec![exam_action("hold-exam")],
        target: PathTarget::NextStep {
          step_id: "baseline-exam".to_string(),
        },
        probability: Some(30.0),
      },
    ],
    quality_checks: Vec::new(),
    terminal: false,
    fallback_to_review: false,
    estimated_duration_days: Some(1),
    max_wait_days: Some(7),
  };

  let stimulation = Step {
    step_id: "stimulation".to_string(),
    name: "stimulation".to_string(),
    description: String::new(),
    step_type: StepType::Injection,
    on_entry_actions: Vec::new(),
    decision_point: None,
    exit_paths: vec![ExitPath {
      path_id: "done".to_string(),
      name: "stimulation complete".to_string(),
      conditions: Vec::new(),
      actions: Vec::new(),
      target: PathTarget::NextStep {
        step_id: "complete".to_string(),
      },
      probability: None,
    }],
    quality_checks: Vec::new(),
    terminal: false,
    fallback_to_review: false,
    estimated_duration_days: Some(6),
    max_wait_days: None,
  };

  ProtocolTemplate {
    template_id: "donor-superovulation".to_string(),
    name: "Donor superovulation".to_string(),
    description: String::new(),
    category: TemplateCategory::DonorComplete,
    version: 0,
    applicable_roles: Vec::new(),
    applicable_species: vec!["camel".to_string()],
    steps: vec![baseline, stimulation, terminal_step("complete")],
    starting_step: "baseline-exam".to_string(),
    max_duration_days: 30,
    priority: Priority::High,
    auto_start: false,
    alternative_rules: vec![AlternativeRule {
      rule_id: "poor-response".to_string(),
      trigger_description: "poor stimulation response".to_string(),
      target_template_id: "recipient-sync".to_string(),
      preserve_data: vec!["baseline_exam_id".to_string()],
      reset_data: vec!["stimulation_day".to_string()],
      requires_approval: false,
    }],
    prediction: None,
  }
}

fn recipient_template() -> ProtocolTemplate {
  ProtocolTemplate {
    template_id: "recipient-sync".to_string(),
    name: "Recipient synchronization".to_string(),
    description: String::new(),
    category: TemplateCategory::RecipientSync,
    version: 0,
    applicable_roles: Vec::new(),
    applicable_species: vec!["camel".to_string()],
    steps: vec![
      Step {
        step_id: "sync-start".to_string(),
        name: "sync start".to_string(),
        description: String::new(),
        step_type: StepType::Injection,
        on_entry_actions: Vec::new(),
        decision_point: None,
        exit_paths: vec![ExitPath {
          path_id: "done".to_string(),
          name: "synchronized".to_string(),
          conditions: Vec::new(),
          actions: Vec::new(),
          target: PathTarget::NextStep {
            step_id: "sync-complete".to_string(),
          },
          probability: None,
        }],
        quality_checks: Vec::new(),
        terminal: false,
        fallback_to_review: false,
        estimated_duration_days: None,
        max_wait_days: None,
      },
      terminal_step("sync-complete"),
    ],
    starting_step: "sync-start".to_string(),
    max_duration_days: 21,
    priority: Priority::Medium,
    auto_start: false,
    alternative_rules: Vec::new(),
    prediction: None,
  }
}

fn ready_snapshot(subject_id: &str) -> Snapshot {
  Snapshot::new(
    subject_id,
    serde_json::json!({
      "follicle_count": 4,
      "uterine_status": "healthy",
    }),
    Utc::now(),
  )
}

fn options() -> AssignOptions {
  AssignOptions {
    start_date: None,
    owner: Some("dr-hassan".to_string()),
    priority: None,
    reasoning: Some("spring breeding batch".to_string()),
    notes: Vec::new(),
  }
}

#[tokio::test]
async fn satisfied_conditions_take_the_success_path_with_its_actions() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();
  let instance = &report.created[0];

  let advanced = h
    .manager
    .advance(&instance.instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  assert_eq!(advanced.current_step_id, "stimulation");
  assert_eq!(advanced.status, InstanceStatus::Active);
  assert_eq!(advanced.completed_steps.0, vec!["baseline-exam"]);
  assert!(advanced.block_reason.is_none());

  // The ready path's action set ran: FSH injection plus the recheck exam.
  assert_eq!(h.injection.call_count(), 1);
  assert_eq!(h.ultrasound.call_count(), 1);
  let exams = h.ultrasound.requests().await;
  assert_eq!(exams[0].idempotency_key, format!("{}:recheck-exam:1", instance.instance_id));
  // The exam carried its two-day delay as a scheduling hint.
  assert!(exams[0].not_before.is_some());
}

#[tokio::test]
async fn unsatisfied_conditions_fall_through_to_the_next_declared_path() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots
    .insert(Snapshot::new(
      "camel-2",
      serde_json::json!({ "follicle_count": 1, "uterine_status": "healthy" }),
      Utc::now(),
    ))
    .await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-2".to_string()], options())
    .await
    .unwrap();
  let advanced = h
    .manager
    .advance(&report.created[0].instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  // The hold path loops back to the same step.
  assert_eq!(advanced.current_step_id, "baseline-exam");
  assert_eq!(h.injection.call_count(), 0);
  assert_eq!(h.ultrasound.call_count(), 1);
}

#[tokio::test]
async fn bulk_assignment_creates_independent_instances() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();

  let subjects: Vec<String> = (1..=8).map(|i| format!("camel-{i}")).collect();
  for subject in &subjects {
    h.snapshots.insert(ready_snapshot(subject)).await;
  }

  let report = h
    .manager
    .assign("donor-superovulation", &subjects, options())
    .await
    .unwrap();
  assert_eq!(report.created.len(), 8);
  assert!(report.rejected.is_empty());
  for instance in &report.created {
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.current_step_id, "baseline-exam");
  }

  // Advancing one instance never moves any other.
  let advanced = h
    .manager
    .advance(&report.created[0].instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();
  assert_eq!(advanced.current_step_id, "stimulation");

  for other in &report.created[1..] {
    let loaded = h.store.get_instance(&other.instance_id).await.unwrap();
    assert_eq!(loaded.current_step_id, "baseline-exam");
  }
}

#[tokio::test]
async fn duplicate_assignment_in_category_is_reported_per_subject() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;
  h.snapshots.insert(ready_snapshot("camel-2")).await;

  h.manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();

  let report = h
    .manager
    .assign(
      "donor-superovulation",
      &["camel-1".to_string(), "camel-2".to_string()],
      options(),
    )
    .await
    .unwrap();

  assert_eq!(report.created.len(), 1);
  assert_eq!(report.created[0].subject_id, "camel-2");
  assert_eq!(report.rejected.len(), 1);
  assert_eq!(report.rejected[0].subject_id, "camel-1");
  assert!(report.rejected[0].reason.contains("already has an active instance"));
}

#[tokio::test]
async fn exhausted_retries_escalate_and_block_the_transition() {
  // Three failures: the initial attempt and both retries. The module
  // recovers afterwards so a later trigger can commit.
  let injection = RecordingAdapter::fail_first(3);
  let h = harness_with(injection.clone()).await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let blocked = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  // retry_attempts = 2 means exactly 3 total attempts, then escalation.
  assert_eq!(injection.call_count(), 3);
  assert_eq!(blocked.current_step_id, "baseline-exam");
  assert!(blocked.is_blocked());
  assert_eq!(blocked.retry_counters.0.get("start-fsh"), Some(&3));

  // The escalation is persisted and the veterinarian was notified.
  let escalations = h.store.list_escalations(&instance_id).await.unwrap();
  assert_eq!(escalations.len(), 1);
  assert_eq!(escalations[0].escalate_to, "dr-hassan");
  assert!(h.notification.call_count() >= 1);

  // A later trigger with a recovered module retries and commits.
  let advanced = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();
  assert_eq!(advanced.current_step_id, "stimulation");
  assert!(advanced.block_reason.is_none());
}

#[tokio::test]
async fn paused_instances_reject_advance_until_resumed() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let paused = h.manager.pause(&instance_id).await.unwrap();
  assert_eq!(paused.status, InstanceStatus::Paused);

  let err = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::InvalidState { .. }));

  h.manager.resume(&instance_id).await.unwrap();
  let advanced = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();
  assert_eq!(advanced.current_step_id, "stimulation");
}

#[tokio::test]
async fn cancel_raises_a_single_notification_and_is_terminal() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let cancelled = h
    .manager
    .cancel(&instance_id, Some("donor withdrawn from program".to_string()))
    .await
    .unwrap();
  assert_eq!(cancelled.status, InstanceStatus::Cancelled);
  assert_eq!(h.notification.call_count(), 1);

  let err = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn completing_the_final_step_finishes_the_instance() {
  let h = harness().await;
  h.registry.register(donor_template()).unwrap();
  h.snapshots.insert(ready_snapshot("camel-1")).await;

  let report = h
    .manager
    .assign("donor-superovulation", &["camel-1".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  h.manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();
  let done = h
    .manager
    .advance(&instance_id, TriggerEvent::InjectionGiven)
    .await
    .unwrap();

  assert_eq!(done.status, InstanceStatus::Completed);
  assert!(done.completed_at.is_some());
  assert_eq!(
    done.completed_steps.0,
    vec!["baseline-exam", "stimulation", "complete"]
  );

  let status = h.manager.status(&instance_id).await.unwrap();
  assert_eq!(status.progress_percentage, 100.0);
}

fn decision_template() -> ProtocolTemplate {
  let decision = Step {
    step_id: "response-check".to_string(),
    name: "response check".to_string(),
    description: String::new(),
    step_type: StepType::Decision,
    on_entry_actions: Vec::new(),
    decision_point: Some(DecisionPoint {
      decision_id: "d1".to_string(),
      name: "stimulation response".to_string(),
      description: String::new(),
      evaluation_conditions: ready_conditions(),
      matrix: vec![
        DecisionOutcome {
          outcome: OutcomeKind::Success,
          probability: Some(65.0),
          target: Some(PathTarget::NextStep {
            step_id: "flushing-prep".to_string(),
          }),
          required_actions: Vec::new(),
          notes: None,
        },
        DecisionOutcome {
          outcome: OutcomeKind::AlternativeNeeded,
          probability: Some(35.0),
          target: Some(PathTarget::AlternativeTemplate {
            template_id: "recipient-sync".to_string(),
          }),
          required_actions: Vec::new(),
          notes: None,
        },
      ],
      allow_manual_override: true,
      manual_options: vec![ManualOption {
        option_id: "force-flush".to_string(),
        label: "proceed to flushing".to_string(),
        description: String::new(),
        target: PathTarget::NextStep {
          step_id: "flushing-prep".to_string(),
        },
        requires_justification: true,
      }],
      escalation_rules: Vec::new(),
      historical_outcomes: Vec::new(),
    }),
    exit_paths: Vec::new(),
    quality_checks: Vec::new(),
    terminal: false,
    fallback_to_review: false,
    estimated_duration_days: None,
    max_wait_days: None,
  };

  ProtocolTemplate {
    template_id: "donor-decision".to_string(),
    name: "Donor with decision point".to_string(),
    description: String::new(),
    category: TemplateCategory::DonorComplete,
    version: 0,
    applicable_roles: Vec::new(),
    applicable_species: Vec::new(),
    steps: vec![decision, terminal_step("flushing-prep")],
    starting_step: "response-check".to_string(),
    max_duration_days: 30,
    priority: Priority::High,
    auto_start: false,
    alternative_rules: vec![AlternativeRule {
      rule_id: "poor-response".to_string(),
      trigger_description: "poor stimulation response".to_string(),
      target_template_id: "recipient-sync".to_string(),
      preserve_data: vec!["baseline_exam_id".to_string()],
      reset_data: Vec::new(),
      requires_approval: false,
    }],
    prediction: None,
  }
}

#[tokio::test]
async fn negative_decision_branches_to_the_alternative_template() {
  let h = harness().await;
  h.registry.register(decision_template()).unwrap();
  h.registry.register(recipient_template()).unwrap();
  h.snapshots
    .insert(Snapshot::new(
      "camel-9",
      serde_json::json!({ "follicle_count": 1, "uterine_status": "healthy" }),
      Utc::now(),
    ))
    .await;

  let report = h
    .manager
    .assign("donor-decision", &["camel-9".to_string()], options())
    .await
    .unwrap();
  let old_id = report.created[0].instance_id.clone();

  let new_instance = h
    .manager
    .advance(&old_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  assert_eq!(new_instance.template_id, "recipient-sync");
  assert_eq!(new_instance.current_step_id, "sync-start");
  assert_eq!(new_instance.status, InstanceStatus::Active);

  // The old instance is cancelled with a cross-reference, never deleted.
  let old = h.store.get_instance(&old_id).await.unwrap();
  assert_eq!(old.status, InstanceStatus::Cancelled);
  assert_eq!(old.superseded_by.as_deref(), Some(new_instance.instance_id.as_str()));
  assert_eq!(old.failed_steps.0, vec!["response-check"]);
}

#[tokio::test]
async fn manual_override_requires_justification_and_routes_directly() {
  let h = harness().await;
  h.registry.register(decision_template()).unwrap();
  h.registry.register(recipient_template()).unwrap();
  h.snapshots
    .insert(Snapshot::new(
      "camel-9",
      serde_json::json!({ "follicle_count": 1, "uterine_status": "healthy" }),
      Utc::now(),
    ))
    .await;

  let report = h
    .manager
    .assign("donor-decision", &["camel-9".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let err = h
    .manager
    .advance(
      &instance_id,
      TriggerEvent::ManualOverride {
        option_id: "force-flush".to_string(),
        justification: None,
        decided_by: "dr-hassan".to_string(),
      },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::ManualOverrideRejected { .. }));

  let advanced = h
    .manager
    .advance(
      &instance_id,
      TriggerEvent::ManualOverride {
        option_id: "force-flush".to_string(),
        justification: Some("donor history supports flushing".to_string()),
        decided_by: "dr-hassan".to_string(),
      },
    )
    .await
    .unwrap();

  // The automatic evaluation disagreed, so the step counts as skipped.
  assert_eq!(advanced.status, InstanceStatus::Completed);
  assert_eq!(advanced.skipped_steps.0, vec!["response-check"]);
}

fn approval_template() -> ProtocolTemplate {
  let mut template = decision_template();
  template.template_id = "donor-approval".to_string();
  template.alternative_rules[0].requires_approval = true;
  template
}

#[tokio::test]
async fn approval_gated_transition_stages_then_applies() {
  let h = harness().await;
  h.registry.register(approval_template()).unwrap();
  h.registry.register(recipient_template()).unwrap();
  h.snapshots
    .insert(Snapshot::new(
      "camel-9",
      serde_json::json!({ "follicle_count": 1, "uterine_status": "healthy" }),
      Utc::now(),
    ))
    .await;

  let report = h
    .manager
    .assign("donor-approval", &["camel-9".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let staged = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  // Still on the old template, blocked with a readable reason.
  assert_eq!(staged.instance_id, instance_id);
  assert_eq!(staged.status, InstanceStatus::Active);
  assert!(staged.block_reason.as_deref().unwrap_or("").contains("awaits approval"));

  // Find the staged assignment and approve it.
  let timeline = h.store.list_timeline(&instance_id).await.unwrap();
  assert!(timeline.iter().any(|e| e.message.contains("staged for approval")));

  let status = h.manager.status(&instance_id).await.unwrap();
  assert!(status.block_reason.is_some());

  let assignments = h.store.list_assignments(&instance_id).await.unwrap();
  assert_eq!(assignments.len(), 1);
  assert_eq!(assignments[0].status, AssignmentStatus::PendingApproval);
  let assignment_id = assignments[0].assignment_id.clone();

  let new_instance = h
    .manager
    .approve_alternative(&assignment_id, "dr-lead")
    .await
    .unwrap();
  assert_eq!(new_instance.template_id, "recipient-sync");

  let old = h.store.get_instance(&instance_id).await.unwrap();
  assert_eq!(old.status, InstanceStatus::Cancelled);

  let assignment = h.store.get_assignment(&assignment_id).await.unwrap();
  assert_eq!(assignment.status, AssignmentStatus::Applied);
  assert_eq!(assignment.approved_by.as_deref(), Some("dr-lead"));
}

fn quality_gate_template() -> ProtocolTemplate {
  let mut template = donor_template();
  template.template_id = "donor-quality".to_string();
  template.steps[0].quality_checks = vec![QualityCheck {
    check_id: "q1".to_string(),
    name: "no uterine fluid".to_string(),
    condition: condition("uterine_fluid", CompareOp::Eq, FieldValue::Flag(false)),
    severity: CheckSeverity::Critical,
    requires_verification: false,
  }];
  template
}

#[tokio::test]
async fn failing_critical_quality_check_blocks_and_escalates() {
  let h = harness().await;
  h.registry.register(quality_gate_template()).unwrap();
  h.snapshots
    .insert(Snapshot::new(
      "camel-4",
      serde_json::json!({
        "follicle_count": 5,
        "uterine_status": "healthy",
        "uterine_fluid": true,
      }),
      Utc::now(),
    ))
    .await;

  let report = h
    .manager
    .assign("donor-quality", &["camel-4".to_string()], options())
    .await
    .unwrap();
  let instance_id = report.created[0].instance_id.clone();

  let blocked = h
    .manager
    .advance(&instance_id, TriggerEvent::ExamCompleted)
    .await
    .unwrap();

  assert_eq!(blocked.current_step_id, "baseline-exam");
  assert!(blocked.block_reason.as_deref().unwrap_or("").contains("quality checks failed"));

  let escalations = h.store.list_escalations(&instance_id).await.unwrap();
  assert_eq!(escalations.len(), 1);
  assert!(escalations[0].message.contains("no uterine fluid"));
}

//! Retry and escalation policy.
//!
//! Drives an action through `PENDING → EXECUTING → SUCCESS`, or through
//! `FAILED_RETRYABLE → EXECUTING` loops until the configured retries are
//! exhausted, at which point the action is `ESCALATED`: a notification
//! goes to the assigned veterinarian and the fallback action, if any, is
//! dispatched once. Escalation is reported, never swallowed, and never
//! blocks sibling actions in the same path.

use std::time::Duration;

use herdflow_protocol::{
  Action, ActionParams, ActionPriority, FailurePolicy, ModuleKind, Urgency,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::{ActionDispatcher, ActionResult, DispatchContext};

/// States of the per-action settle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
  Pending,
  Executing,
  Succeeded,
  FailedRetryable,
  Escalated,
  Cancelled,
}

/// Escalation details carried out of a settled action.
#[derive(Debug, Clone)]
pub struct EscalationNotice {
  pub action_id: String,
  pub message: String,
  pub escalate_to: String,
  pub urgency: Urgency,
}

/// Terminal record of one action's settlement.
#[derive(Debug, Clone)]
pub struct SettledAction {
  pub action_id: String,
  pub state: ActionState,
  /// Total dispatch attempts consumed, initial attempt included.
  pub attempts: u32,
  pub record_id: Option<String>,
  pub last_error: Option<String>,
  /// Whether an escalated settle still permits the transition to commit.
  pub accept_partial_failure: bool,
  pub escalation: Option<EscalationNotice>,
  pub fallback_dispatched: bool,
}

impl SettledAction {
  /// An escalated action that does not accept partial failure blocks the
  /// transition; so does a cancelled one.
  pub fn blocks_commit(&self) -> bool {
    match self.state {
      ActionState::Succeeded => false,
      ActionState::Escalated => !self.accept_partial_failure,
      _ => true,
    }
  }
}

/// Settles actions by retrying failed dispatches and escalating on
/// exhaustion.
#[derive(Clone)]
pub struct RetryEscalationPolicy {
  dispatcher: ActionDispatcher,
  /// Wall-clock length of one `retry_delay_hours` unit. Production keeps
  /// the obvious value; tests shrink it to settle in milliseconds.
  retry_delay_unit: Duration,
}

impl RetryEscalationPolicy {
  pub fn new(dispatcher: ActionDispatcher, retry_delay_unit: Duration) -> Self {
    Self {
      dispatcher,
      retry_delay_unit,
    }
  }

  /// Drive one action to a terminal state.
  pub async fn settle(
    &self,
    action: &Action,
    ctx: &DispatchContext,
    cancel: &CancellationToken,
  ) -> SettledAction {
    let policy = &action.failure_policy;
    let mut attempts = 0u32;
    let mut last_error = None;
    let mut record_id = None;

    let state = loop {
      if cancel.is_cancelled() {
        break ActionState::Cancelled;
      }

      attempts += 1;
      match self.dispatcher.dispatch(action, ctx, attempts).await {
        ActionResult::Success { record_id: id } => {
          record_id = id;
          break ActionState::Succeeded;
        }
        ActionResult::Failure { detail } => {
          warn!(
            instance_id = %ctx.instance_id,
            action_id = %action.action_id,
            attempt = attempts,
            error = %detail,
            "action_attempt_failed"
          );
          last_error = Some(detail);

          // `retry_attempts` counts retries after the initial attempt.
          if attempts > policy.retry_attempts {
            break ActionState::Escalated;
          }

          let delay = self.retry_delay(policy);
          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break ActionState::Cancelled,
          }
        }
      }
    };

    match state {
      ActionState::Succeeded => {
        info!(
          instance_id = %ctx.instance_id,
          action_id = %action.action_id,
          attempts,
          "action_settled"
        );
        SettledAction {
          action_id: action.action_id.clone(),
          state,
          attempts,
          record_id,
          last_error,
          accept_partial_failure: policy.accept_partial_failure,
          escalation: None,
          fallback_dispatched: false,
        }
      }
      ActionState::Cancelled => SettledAction {
        action_id: action.action_id.clone(),
        state,
        attempts,
        record_id: None,
        last_error,
        accept_partial_failure: policy.accept_partial_failure,
        escalation: None,
        fallback_dispatched: false,
      },
      _ => self.escalate(action, ctx, attempts, last_error).await,
    }
  }

  async fn escalate(
    &self,
    action: &Action,
    ctx: &DispatchContext,
    attempts: u32,
    last_error: Option<String>,
  ) -> SettledAction {
    let policy = &action.failure_policy;
    let escalate_to = ctx
      .owner
      .clone()
      .unwrap_or_else(|| "on-call-veterinarian".to_string());
    let urgency = escalation_urgency(action.priority);

    error!(
      instance_id = %ctx.instance_id,
      action_id = %action.action_id,
      attempts,
      escalate_to = %escalate_to,
      "action_escalated"
    );

    if policy.notify_veterinarian {
      let notice = escalation_notification(action, &escalate_to, urgency);
      if let ActionResult::Failure { detail } = self.dispatcher.dispatch(&notice, ctx, 1).await {
        // The persisted escalation record is the source of truth; a lost
        // notification is loud in the logs but does not change state.
        error!(
          instance_id = %ctx.instance_id,
          action_id = %action.action_id,
          error = %detail,
          "escalation_notification_failed"
        );
      }
    }

    // The fallback gets a single attempt, outside the main retry count.
    let mut fallback_dispatched = false;
    if let Some(fallback) = &policy.fallback_action {
      fallback_dispatched = true;
      match self.dispatcher.dispatch(fallback, ctx, 1).await {
        ActionResult::Success { .. } => {
          info!(
            instance_id = %ctx.instance_id,
            action_id = %action.action_id,
            fallback_id = %fallback.action_id,
            "fallback_action_dispatched"
          );
        }
        ActionResult::Failure { detail } => {
          error!(
            instance_id = %ctx.instance_id,
            action_id = %action.action_id,
            fallback_id = %fallback.action_id,
            error = %detail,
            "fallback_action_failed"
          );
        }
      }
    }

    SettledAction {
      action_id: action.action_id.clone(),
      state: ActionState::Escalated,
      attempts,
      record_id: None,
      last_error,
      accept_partial_failure: policy.accept_partial_failure,
      escalation: Some(EscalationNotice {
        action_id: action.action_id.clone(),
        message: policy.escalation_message.clone(),
        escalate_to,
        urgency,
      }),
      fallback_dispatched,
    }
  }

  fn retry_delay(&self, policy: &FailurePolicy) -> Duration {
    self.retry_delay_unit * policy.retry_delay_hours.max(1)
  }
}

fn escalation_urgency(priority: ActionPriority) -> Urgency {
  match priority {
    ActionPriority::Low | ActionPriority::Normal => Urgency::Routine,
    ActionPriority::High => Urgency::Urgent,
    ActionPriority::Urgent => Urgency::Emergency,
  }
}

/// Synthetic notification action for a raised escalation. Its own policy
/// never retries or notifies, so escalation cannot recurse.
fn escalation_notification(action: &Action, escalate_to: &str, urgency: Urgency) -> Action {
  Action {
    action_id: format!("{}-escalation", action.action_id),
    params: ActionParams::Notify {
      recipient: escalate_to.to_string(),
      message: action.failure_policy.escalation_message.clone(),
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
  }
}

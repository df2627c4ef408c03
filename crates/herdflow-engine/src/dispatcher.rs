//! Action dispatch.
//!
//! One bounded adapter call per attempt. Retry lives a layer above so
//! every attempt is a fresh call with a deterministic idempotency key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use herdflow_modules::{ModuleRegistry, ModuleRequest};
use herdflow_protocol::{Action, ActionParams, ModuleKind};
use tracing::{debug, warn};

/// Identifies the instance an action is dispatched for.
#[derive(Debug, Clone)]
pub struct DispatchContext {
  pub instance_id: String,
  pub subject_id: String,
  /// Assigned veterinarian; escalation notices go here.
  pub owner: Option<String>,
}

/// Terminal result of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
  Success { record_id: Option<String> },
  Failure { detail: String },
}

/// Submits actions to external module adapters.
#[derive(Clone)]
pub struct ActionDispatcher {
  modules: ModuleRegistry,
  timeout: Duration,
}

impl ActionDispatcher {
  pub fn new(modules: ModuleRegistry, timeout: Duration) -> Self {
    Self { modules, timeout }
  }

  /// Submit one attempt of an action.
  ///
  /// `attempt` is 1-based and goes into the idempotency key, so a retry
  /// is a distinct request to the module while a replay of the same
  /// attempt is deduplicatable.
  pub async fn dispatch(
    &self,
    action: &Action,
    ctx: &DispatchContext,
    attempt: u32,
  ) -> ActionResult {
    let idempotency_key = format!("{}:{}:{}", ctx.instance_id, action.action_id, attempt);

    // Wait markers settle inside the engine; there is no module to call.
    if action.target_module == ModuleKind::Internal {
      let days = match &action.params {
        ActionParams::WaitDays { days } => *days,
        _ => 0,
      };
      debug!(
        instance_id = %ctx.instance_id,
        action_id = %action.action_id,
        days,
        "internal_action_settled"
      );
      return ActionResult::Success { record_id: None };
    }

    let request = ModuleRequest {
      module: action.target_module,
      subject_id: ctx.subject_id.clone(),
      params: action.params.clone(),
      priority: action.priority,
      not_before: not_before(action, Utc::now()),
      idempotency_key: idempotency_key.clone(),
    };

    let adapter = match self.modules.get(action.target_module) {
      Ok(adapter) => adapter.clone(),
      Err(e) => {
        return ActionResult::Failure {
          detail: e.to_string(),
        };
      }
    };

    debug!(
      instance_id = %ctx.instance_id,
      action_id = %action.action_id,
      module = %action.target_module,
      attempt,
      idempotency_key = %idempotency_key,
      "dispatching_action"
    );

    match tokio::time::timeout(self.timeout, adapter.execute(request)).await {
      Ok(Ok(response)) => ActionResult::Success {
        record_id: response.created_record_id,
      },
      Ok(Err(e)) => {
        warn!(
          instance_id = %ctx.instance_id,
          action_id = %action.action_id,
          module = %action.target_module,
          error = %e,
          "module_call_failed"
        );
        ActionResult::Failure {
          detail: e.to_string(),
        }
      }
      Err(_) => ActionResult::Failure {
        detail: format!(
          "module '{}' timed out after {}ms",
          action.target_module,
          self.timeout.as_millis()
        ),
      },
    }
  }
}

/// The earliest point the module should act on the request.
fn not_before(action: &Action, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let delay = action.delay.filter(|d| !d.is_zero())?;
  let offset = chrono::Duration::days(i64::from(delay.days.unwrap_or(0)))
    + chrono::Duration::hours(i64::from(delay.hours.unwrap_or(0)));
  Some(now + offset)
}

//! Engine errors.

use herdflow_modules::SnapshotError;
use herdflow_registry::RegistryError;
use herdflow_store::InstanceStatus;

/// Errors that can occur while driving an instance.
///
/// Blocked transitions are not errors: a blocked instance is returned
/// with its `block_reason` set so the stall stays queryable. Errors here
/// are calls that cannot be carried out at all.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Template lookup or registration failed.
  #[error(transparent)]
  Template(#[from] RegistryError),

  /// Storage operation failed.
  #[error("storage operation failed")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// Snapshot query failed.
  #[error(transparent)]
  Snapshot(#[from] SnapshotError),

  /// Step referenced by the instance is missing from its template.
  #[error("step '{step_id}' not found in template '{template_id}'")]
  StepNotFound { template_id: String, step_id: String },

  /// The operation does not apply to the instance's current status.
  #[error("cannot {operation} instance '{instance_id}' in status {status:?}")]
  InvalidState {
    instance_id: String,
    status: InstanceStatus,
    operation: &'static str,
  },

  /// A manual override was supplied but cannot be honored.
  #[error("manual override rejected: {reason}")]
  ManualOverrideRejected { reason: String },

  /// The subject already runs an active instance in this template category.
  #[error("subject '{subject_id}' already has an active instance in category '{category}'")]
  AlreadyAssigned { subject_id: String, category: String },

  /// An alternative assignment is not in a state the operation accepts.
  #[error("assignment '{assignment_id}' is not pending approval")]
  AssignmentNotPending { assignment_id: String },
}

impl EngineError {
  /// Wrap a store error.
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    EngineError::Store(Box::new(err))
  }
}

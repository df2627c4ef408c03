//! Herdflow Store
//!
//! This crate provides the storage trait and implementations for workflow
//! instances and their audit trail. Data is persisted to SQLite.
//!
//! The [`Store`] trait defines operations for:
//! - Creating and updating workflow instances
//! - Appending and querying the per-instance timeline
//! - Recording alternative-workflow assignments and escalations

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
/// JSON column wrapper, re-exported so callers build rows without a
/// direct sqlx dependency.
pub use sqlx::types::Json;
pub use types::{
  AlternativeAssignment, AssignmentStatus, EscalationRecord, InstanceStatus, TimelineEntry,
  TimelineKind, TriggerReason, WorkflowInstance,
};

use herdflow_protocol::TemplateCategory;

/// Storage trait for workflow instances and audit records.
pub trait Store {
  /// Error type for storage operations.
  type Error;

  /// Create a new workflow instance.
  fn create_instance(
    &self,
    instance: &WorkflowInstance,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// Get a workflow instance by ID.
  fn get_instance(
    &self,
    instance_id: &str,
  ) -> impl std::future::Future<Output = Result<WorkflowInstance, Self::Error>> + Send;

  /// Persist the full state of an instance.
  fn update_instance(
    &self,
    instance: &WorkflowInstance,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// The non-terminal instance a subject has in a template category, if any.
  fn active_in_category(
    &self,
    subject_id: &str,
    category: TemplateCategory,
  ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, Self::Error>> + Send;

  /// List all instances for a subject, newest first.
  fn list_for_subject(
    &self,
    subject_id: &str,
  ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, Self::Error>> + Send;

  /// List instances by status, newest first.
  fn list_by_status(
    &self,
    status: InstanceStatus,
  ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, Self::Error>> + Send;

  /// Append a timeline entry.
  fn append_timeline(
    &self,
    entry: &TimelineEntry,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// List timeline entries for an instance, oldest first.
  fn list_timeline(
    &self,
    instance_id: &str,
  ) -> impl std::future::Future<Output = Result<Vec<TimelineEntry>, Self::Error>> + Send;

  /// Record an alternative-workflow assignment.
  fn create_assignment(
    &self,
    assignment: &AlternativeAssignment,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// Get an assignment by ID.
  fn get_assignment(
    &self,
    assignment_id: &str,
  ) -> impl std::future::Future<Output = Result<AlternativeAssignment, Self::Error>> + Send;

  /// Update an assignment (approval, application).
  fn update_assignment(
    &self,
    assignment: &AlternativeAssignment,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// List assignments that originated from an instance, newest first.
  fn list_assignments(
    &self,
    instance_id: &str,
  ) -> impl std::future::Future<Output = Result<Vec<AlternativeAssignment>, Self::Error>> + Send;

  /// Record a raised escalation.
  fn create_escalation(
    &self,
    escalation: &EscalationRecord,
  ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

  /// List escalations for an instance, newest first.
  fn list_escalations(
    &self,
    instance_id: &str,
  ) -> impl std::future::Future<Output = Result<Vec<EscalationRecord>, Self::Error>> + Send;
}

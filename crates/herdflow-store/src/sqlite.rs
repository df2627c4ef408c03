use herdflow_protocol::TemplateCategory;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::{
  AlternativeAssignment, EscalationRecord, InstanceStatus, Store, TimelineEntry, WorkflowInstance,
};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

impl Store for SqliteStore {
  type Error = sqlx::Error;

  async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO protocol_instances (
                instance_id, subject_id, template_id, template_version, category,
                current_step_id, status, block_reason,
                completed_steps, failed_steps, skipped_steps, retry_counters,
                context, priority, owner, notes,
                started_at, updated_at, completed_at, superseded_by
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&instance.instance_id)
    .bind(&instance.subject_id)
    .bind(&instance.template_id)
    .bind(instance.template_version)
    .bind(&instance.category)
    .bind(&instance.current_step_id)
    .bind(instance.status)
    .bind(&instance.block_reason)
    .bind(&instance.completed_steps)
    .bind(&instance.failed_steps)
    .bind(&instance.skipped_steps)
    .bind(&instance.retry_counters)
    .bind(&instance.context)
    .bind(&instance.priority)
    .bind(&instance.owner)
    .bind(&instance.notes)
    .bind(instance.started_at)
    .bind(instance.updated_at)
    .bind(instance.completed_at)
    .bind(&instance.superseded_by)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT instance_id, subject_id, template_id, template_version, category,
                   current_step_id, status, block_reason,
                   completed_steps, failed_steps, skipped_steps, retry_counters,
                   context, priority, owner, notes,
                   started_at, updated_at, completed_at, superseded_by
            FROM protocol_instances
            WHERE instance_id = ?
            "#,
    )
    .bind(instance_id)
    .fetch_one(&self.pool)
    .await
  }

  async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            UPDATE protocol_instances
            SET current_step_id = ?, status = ?, block_reason = ?,
                completed_steps = ?, failed_steps = ?, skipped_steps = ?,
                retry_counters = ?, context = ?, priority = ?, owner = ?,
                notes = ?, updated_at = ?, completed_at = ?, superseded_by = ?
            WHERE instance_id = ?
            "#,
    )
    .bind(&instance.current_step_id)
    .bind(instance.status)
    .bind(&instance.block_reason)
    .bind(&instance.completed_steps)
    .bind(&instance.failed_steps)
    .bind(&instance.skipped_steps)
    .bind(&instance.retry_counters)
    .bind(&instance.context)
    .bind(&instance.priority)
    .bind(&instance.owner)
    .bind(&instance.notes)
    .bind(instance.updated_at)
    .bind(instance.completed_at)
    .bind(&instance.superseded_by)
    .bind(&instance.instance_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn active_in_category(
    &self,
    subject_id: &str,
    category: TemplateCategory,
  ) -> Result<Option<WorkflowInstance>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT instance_id, subject_id, template_id, template_version, category,
                   current_step_id, status, block_reason,
                   completed_steps, failed_steps, skipped_steps, retry_counters,
                   context, priority, owner, notes,
                   started_at, updated_at, completed_at, superseded_by
            FROM protocol_instances
            WHERE subject_id = ?
              AND category = ?
              AND status IN ('active', 'paused', 'pending_approval')
            ORDER BY started_at DESC
            LIMIT 1
            "#,
    )
    .bind(subject_id)
    .bind(Json(category))
    .fetch_optional(&self.pool)
    .await
  }

  async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<WorkflowInstance>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT instance_id, subject_id, template_id, template_version, category,
                   current_step_id, status, block_reason,
                   completed_steps, failed_steps, skipped_steps, retry_counters,
                   context, priority, owner, notes,
                   started_at, updated_at, completed_at, superseded_by
            FROM protocol_instances
            WHERE subject_id = ?
            ORDER BY started_at DESC
            "#,
    )
    .bind(subject_id)
    .fetch_all(&self.pool)
    .await
  }

  async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT instance_id, subject_id, template_id, template_version, category,
                   current_step_id, status, block_reason,
                   completed_steps, failed_steps, skipped_steps, retry_counters,
                   context, priority, owner, notes,
                   started_at, updated_at, completed_at, superseded_by
            FROM protocol_instances
            WHERE status = ?
            ORDER BY started_at DESC
            "#,
    )
    .bind(status)
    .fetch_all(&self.pool)
    .await
  }

  async fn append_timeline(&self, entry: &TimelineEntry) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO instance_timeline (entry_id, instance_id, step_id, kind, message, at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&entry.entry_id)
    .bind(&entry.instance_id)
    .bind(&entry.step_id)
    .bind(entry.kind)
    .bind(&entry.message)
    .bind(entry.at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_timeline(&self, instance_id: &str) -> Result<Vec<TimelineEntry>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT entry_id, instance_id, step_id, kind, message, at
            FROM instance_timeline
            WHERE instance_id = ?
            ORDER BY at ASC
            "#,
    )
    .bind(instance_id)
    .fetch_all(&self.pool)
    .await
  }

  async fn create_assignment(&self, assignment: &AlternativeAssignment) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO alternative_assignments (
                assignment_id, instance_id, step_id, trigger_reason, target_template_id,
                preserved, reset, requires_approval, approved_by, approved_at,
                status, new_instance_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&assignment.assignment_id)
    .bind(&assignment.instance_id)
    .bind(&assignment.step_id)
    .bind(assignment.trigger_reason)
    .bind(&assignment.target_template_id)
    .bind(&assignment.preserved)
    .bind(&assignment.reset)
    .bind(assignment.requires_approval)
    .bind(&assignment.approved_by)
    .bind(assignment.approved_at)
    .bind(assignment.status)
    .bind(&assignment.new_instance_id)
    .bind(assignment.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_assignment(&self, assignment_id: &str) -> Result<AlternativeAssignment, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT assignment_id, instance_id, step_id, trigger_reason, target_template_id,
                   preserved, reset, requires_approval, approved_by, approved_at,
                   status, new_instance_id, created_at
            FROM alternative_assignments
            WHERE assignment_id = ?
            "#,
    )
    .bind(assignment_id)
    .fetch_one(&self.pool)
    .await
  }

  async fn update_assignment(&self, assignment: &AlternativeAssignment) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            UPDATE alternative_assignments
            SET approved_by = ?, approved_at = ?, status = ?, new_instance_id = ?
            WHERE assignment_id = ?
            "#,
    )
    .bind(&assignment.approved_by)
    .bind(assignment.approved_at)
    .bind(assignment.status)
    .bind(&assignment.new_instance_id)
    .bind(&assignment.assignment_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_assignments(
    &self,
    instance_id: &str,
  ) -> Result<Vec<AlternativeAssignment>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT assignment_id, instance_id, step_id, trigger_reason, target_template_id,
                   preserved, reset, requires_approval, approved_by, approved_at,
                   status, new_instance_id, created_at
            FROM alternative_assignments
            WHERE instance_id = ?
            ORDER BY created_at DESC
            "#,
    )
    .bind(instance_id)
    .fetch_all(&self.pool)
    .await
  }

  async fn create_escalation(&self, escalation: &EscalationRecord) -> Result<(), Self::Error> {
    sqlx::query(
      r#"
            INSERT INTO escalations (
                escalation_id, instance_id, step_id, action_id, message,
                escalate_to, urgency, raised_at, acknowledged_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&escalation.escalation_id)
    .bind(&escalation.instance_id)
    .bind(&escalation.step_id)
    .bind(&escalation.action_id)
    .bind(&escalation.message)
    .bind(&escalation.escalate_to)
    .bind(&escalation.urgency)
    .bind(escalation.raised_at)
    .bind(escalation.acknowledged_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_escalations(&self, instance_id: &str) -> Result<Vec<EscalationRecord>, Self::Error> {
    sqlx::query_as(
      r#"
            SELECT escalation_id, instance_id, step_id, action_id, message,
                   escalate_to, urgency, raised_at, acknowledged_at
            FROM escalations
            WHERE instance_id = ?
            ORDER BY raised_at DESC
            "#,
    )
    .bind(instance_id)
    .fetch_all(&self.pool)
    .await
  }
}

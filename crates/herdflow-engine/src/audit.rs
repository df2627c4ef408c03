use chrono::Utc;
use herdflow_store::{TimelineEntry, TimelineKind};

/// Build a timeline entry stamped now.
pub(crate) fn timeline_entry(
  instance_id: &str,
  step_id: Option<&str>,
  kind: TimelineKind,
  message: impl Into<String>,
) -> TimelineEntry {
  TimelineEntry {
    entry_id: uuid::Uuid::new_v4().to_string(),
    instance_id: instance_id.to_string(),
    step_id: step_id.map(str::to_string),
    kind,
    message: message.into(),
    at: Utc::now(),
  }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::FieldRef;

/// A read-only view of a subject's current clinical and operational data.
///
/// `data` is the document conditions resolve field paths against;
/// `events` carries named event timestamps (e.g. `last_injection`) for
/// time-constrained conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub subject_id: String,
  pub data: serde_json::Value,
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub events: HashMap<String, DateTime<Utc>>,
  pub taken_at: DateTime<Utc>,
}

impl Snapshot {
  pub fn new(subject_id: impl Into<String>, data: serde_json::Value, taken_at: DateTime<Utc>) -> Self {
    Self {
      subject_id: subject_id.into(),
      data,
      events: HashMap::new(),
      taken_at,
    }
  }

  pub fn with_event(mut self, name: impl Into<String>, at: DateTime<Utc>) -> Self {
    self.events.insert(name.into(), at);
    self
  }

  /// Resolve a dotted path. JSON `null` counts as missing.
  pub fn resolve(&self, path: &str) -> Option<&serde_json::Value> {
    let mut current = &self.data;
    for segment in path.split('.') {
      current = match current {
        serde_json::Value::Object(map) => map.get(segment)?,
        _ => return None,
      };
    }
    if current.is_null() { None } else { Some(current) }
  }

  /// Resolve a field reference: primary path first, then fallbacks in
  /// order, until one yields a non-missing value.
  pub fn resolve_field(&self, field: &FieldRef) -> Option<&serde_json::Value> {
    field.candidates().find_map(|path| self.resolve(path))
  }

  /// Elapsed whole days from a named event to when the snapshot was taken.
  pub fn days_since_event(&self, event: &str) -> Option<i64> {
    self
      .events
      .get(event)
      .map(|at| (self.taken_at - *at).num_days())
  }
}

use std::collections::HashMap;

use async_trait::async_trait;
use herdflow_protocol::Snapshot;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("no snapshot available for subject '{0}'")]
  SubjectNotFound(String),

  #[error("snapshot query failed for subject '{subject_id}': {message}")]
  QueryFailed { subject_id: String, message: String },
}

/// Read-only access to a subject's current clinical data.
///
/// The engine takes a fresh snapshot per transition; providers never see
/// writes from the engine.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
  async fn snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError>;
}

/// In-memory provider serving pre-loaded snapshots. Used by tests and by
/// the CLI when a snapshot is supplied on stdin.
#[derive(Default)]
pub struct StaticSnapshots {
  snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl StaticSnapshots {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert(&self, snapshot: Snapshot) {
    let mut snapshots = self.snapshots.lock().await;
    snapshots.insert(snapshot.subject_id.clone(), snapshot);
  }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshots {
  async fn snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError> {
    let snapshots = self.snapshots.lock().await;
    snapshots
      .get(subject_id)
      .cloned()
      .ok_or_else(|| SnapshotError::SubjectNotFound(subject_id.to_string()))
  }
}

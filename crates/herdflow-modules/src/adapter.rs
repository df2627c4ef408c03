use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herdflow_protocol::{ActionParams, ActionPriority, ModuleKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command submitted to an external clinical module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRequest {
  pub module: ModuleKind,
  pub subject_id: String,
  pub params: ActionParams,
  pub priority: ActionPriority,
  /// Earliest point the module should act on the request.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub not_before: Option<DateTime<Utc>>,
  /// Deterministic per-attempt key so modules can deduplicate replays.
  pub idempotency_key: String,
}

/// Successful module response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleResponse {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_record_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

/// Errors surfaced by module adapters.
#[derive(Debug, Error)]
pub enum ModuleError {
  #[error("module '{module}' rejected the request: {message}")]
  Rejected { module: ModuleKind, message: String },

  #[error("module '{module}' is unavailable: {message}")]
  Unavailable { module: ModuleKind, message: String },

  #[error("no adapter registered for module '{0}'")]
  NoAdapter(ModuleKind),
}

/// Adapter for one external module (ultrasound scheduling, injections,
/// calendar, breeding, flushing/OPU, status updates, notifications).
///
/// Each call is a single attempt; retry policy is layered above.
#[async_trait]
pub trait ModuleAdapter: Send + Sync {
  async fn execute(&self, request: ModuleRequest) -> Result<ModuleResponse, ModuleError>;
}

/// Registry mapping module kinds to adapters.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
  adapters: HashMap<ModuleKind, Arc<dyn ModuleAdapter>>,
}

impl ModuleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_adapter(mut self, module: ModuleKind, adapter: Arc<dyn ModuleAdapter>) -> Self {
    self.adapters.insert(module, adapter);
    self
  }

  pub fn register(&mut self, module: ModuleKind, adapter: Arc<dyn ModuleAdapter>) {
    self.adapters.insert(module, adapter);
  }

  pub fn get(&self, module: ModuleKind) -> Result<&Arc<dyn ModuleAdapter>, ModuleError> {
    self.adapters.get(&module).ok_or(ModuleError::NoAdapter(module))
  }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::adapter::{ModuleAdapter, ModuleError, ModuleRequest, ModuleResponse};

/// Adapter that records every request and answers from a script.
///
/// With `fail_first(n)` the first `n` calls fail as unavailable, which is
/// how retry and escalation paths are exercised in tests.
#[derive(Default)]
pub struct RecordingAdapter {
  requests: Mutex<Vec<ModuleRequest>>,
  fail_first: AtomicU32,
  calls: AtomicU32,
}

impl RecordingAdapter {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Fail the first `n` calls before succeeding.
  pub fn fail_first(n: u32) -> Arc<Self> {
    let adapter = Self::default();
    adapter.fail_first.store(n, Ordering::SeqCst);
    Arc::new(adapter)
  }

  pub async fn requests(&self) -> Vec<ModuleRequest> {
    self.requests.lock().await.clone()
  }

  pub fn call_count(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ModuleAdapter for RecordingAdapter {
  async fn execute(&self, request: ModuleRequest) -> Result<ModuleResponse, ModuleError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    let module = request.module;
    self.requests.lock().await.push(request);

    if call < self.fail_first.load(Ordering::SeqCst) {
      return Err(ModuleError::Unavailable {
        module,
        message: format!("scripted failure on call {}", call + 1),
      });
    }

    Ok(ModuleResponse {
      created_record_id: Some(uuid::Uuid::new_v4().to_string()),
      detail: None,
    })
  }
}

/// Adapter that logs the request and reports success.
///
/// The default wiring for modules nobody has integrated yet; keeps the
/// engine observable without a live downstream system.
pub struct LogAdapter;

#[async_trait]
impl ModuleAdapter for LogAdapter {
  async fn execute(&self, request: ModuleRequest) -> Result<ModuleResponse, ModuleError> {
    info!(
      module = %request.module,
      subject_id = %request.subject_id,
      action = request.params.kind(),
      idempotency_key = %request.idempotency_key,
      "module_request"
    );
    Ok(ModuleResponse {
      created_record_id: Some(uuid::Uuid::new_v4().to_string()),
      detail: None,
    })
  }
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use herdflow_protocol::ProtocolTemplate;
use tracing::info;

use crate::error::RegistryError;
use crate::validate::validate;

/// The append-only protocol template registry.
///
/// Templates are validated once at registration and immutable afterwards;
/// registering an id again allocates the next version. Old versions stay
/// retrievable because running instances pin the version they started on.
#[derive(Default)]
pub struct TemplateRegistry {
  // template_id -> versions in registration order (index 0 is version 1)
  inner: RwLock<HashMap<String, Vec<Arc<ProtocolTemplate>>>>,
}

impl TemplateRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validate and register a template, returning the stored (versioned) copy.
  pub fn register(
    &self,
    mut template: ProtocolTemplate,
  ) -> Result<Arc<ProtocolTemplate>, RegistryError> {
    validate(&template)?;

    let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
    let versions = inner.entry(template.template_id.clone()).or_default();
    template.version = versions.len() as u32 + 1;

    info!(
      template_id = %template.template_id,
      version = template.version,
      steps = template.steps.len(),
      "template_registered"
    );

    let stored = Arc::new(template);
    versions.push(stored.clone());
    Ok(stored)
  }

  /// Latest version of a template.
  pub fn get(&self, template_id: &str) -> Result<Arc<ProtocolTemplate>, RegistryError> {
    let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
    inner
      .get(template_id)
      .and_then(|versions| versions.last().cloned())
      .ok_or_else(|| RegistryError::TemplateNotFound {
        template_id: template_id.to_string(),
      })
  }

  /// A specific registered version.
  pub fn get_version(
    &self,
    template_id: &str,
    version: u32,
  ) -> Result<Arc<ProtocolTemplate>, RegistryError> {
    let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
    let versions = inner
      .get(template_id)
      .ok_or_else(|| RegistryError::TemplateNotFound {
        template_id: template_id.to_string(),
      })?;
    versions
      .get(version.saturating_sub(1) as usize)
      .cloned()
      .ok_or(RegistryError::VersionNotFound {
        template_id: template_id.to_string(),
        version,
      })
  }

  /// Latest version of every registered template.
  pub fn list(&self) -> Vec<Arc<ProtocolTemplate>> {
    let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
    let mut templates: Vec<_> = inner
      .values()
      .filter_map(|versions| versions.last().cloned())
      .collect();
    templates.sort_by(|a, b| a.template_id.cmp(&b.template_id));
    templates
  }

  /// Load and register every `*.json` template in a directory.
  ///
  /// Files are registered in name order so versioning is deterministic.
  /// Returns the number of templates registered.
  pub fn load_dir(&self, dir: &Path) -> Result<usize, RegistryError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
      .map_err(|source| RegistryError::Io {
        path: dir.display().to_string(),
        source,
      })?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
      .collect();
    paths.sort();

    let mut count = 0;
    for path in paths {
      let content = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
        path: path.display().to_string(),
        source,
      })?;
      let template: ProtocolTemplate =
        serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
          path: path.display().to_string(),
          source,
        })?;
      self.register(template)?;
      count += 1;
    }

    Ok(count)
  }
}

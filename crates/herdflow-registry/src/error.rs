use thiserror::Error;

/// Reasons a template is rejected at registration.
///
/// Invalid templates never reach the engine; every variant carries enough
/// context to point the author at the offending step.
#[derive(Debug, Error)]
pub enum TemplateValidationError {
  #[error("template '{template_id}' has no steps")]
  NoSteps { template_id: String },

  #[error("template '{template_id}' declares duplicate step id '{step_id}'")]
  DuplicateStepId { template_id: String, step_id: String },

  #[error("starting step '{starting_step}' is not in template '{template_id}'")]
  StartingStepMissing {
    template_id: String,
    starting_step: String,
  },

  #[error("step '{step_id}' routes to unknown step '{target}' in template '{template_id}'")]
  UnknownStepTarget {
    template_id: String,
    step_id: String,
    target: String,
  },

  #[error("step '{step_id}' is unreachable from the starting step in template '{template_id}'")]
  UnreachableStep { template_id: String, step_id: String },

  #[error(
    "step '{step_id}' in template '{template_id}' is a dead end: not terminal, and has neither exit paths nor a decision point"
  )]
  DeadEndStep { template_id: String, step_id: String },

  #[error(
    "step '{step_id}' in template '{template_id}' can stall silently: no unconditional exit path and no manual-review fallback"
  )]
  NoFallbackPath { template_id: String, step_id: String },

  #[error(
    "condition '{condition_id}' on step '{step_id}' attaches {what} to a non-numeric value"
  )]
  NonNumericTolerance {
    step_id: String,
    condition_id: String,
    what: &'static str,
  },

  #[error("wait_days action '{action_id}' on step '{step_id}' must target the internal module")]
  WaitActionNotInternal { step_id: String, action_id: String },

  #[error("decision point on step '{step_id}' has an empty decision matrix")]
  EmptyDecisionMatrix { step_id: String },

  #[error("template '{template_id}' has a zero max_duration_days")]
  ZeroDuration { template_id: String },
}

/// Registry-level errors.
#[derive(Debug, Error)]
pub enum RegistryError {
  #[error(transparent)]
  Validation(#[from] TemplateValidationError),

  #[error("template '{template_id}' is not registered")]
  TemplateNotFound { template_id: String },

  #[error("template '{template_id}' has no version {version}")]
  VersionNotFound { template_id: String, version: u32 },

  #[error("failed to read template file '{path}'")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse template file '{path}'")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

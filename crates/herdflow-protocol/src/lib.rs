//! Herdflow Protocol
//!
//! This crate provides the data model for protocol templates: reusable
//! step graphs describing clinical/reproductive procedures.
//!
//! A template is a set of [`Step`]s linked by conditioned [`ExitPath`]s
//! and [`DecisionPoint`]s. Conditions are evaluated against a read-only
//! [`Snapshot`] of a subject's data; actions are typed commands dispatched
//! to external modules. Templates here are plain data. Validation lives
//! in `herdflow-registry`, interpretation in `herdflow-engine`.

mod action;
mod condition;
mod decision;
mod graph;
mod snapshot;
mod step;
mod template;

pub use action::{
  Action, ActionDelay, ActionParams, ActionPriority, FailurePolicy, InjectionRoute, ModuleKind,
  ProcedureType, Urgency,
};
pub use condition::{
  CompareOp, Condition, FieldRef, FieldValue, LogicalOperator, TimeConstraint,
};
pub use decision::{
  DecisionOutcome, DecisionPoint, EscalationRule, HistoricalOutcome, ManualOption, OutcomeKind,
};
pub use graph::StepGraph;
pub use snapshot::Snapshot;
pub use step::{CheckSeverity, ExitPath, PathTarget, QualityCheck, Step, StepType};
pub use template::{
  AlternativeRule, Priority, ProtocolTemplate, SubjectRole, TemplateCategory,
};

use serde::{Deserialize, Serialize};

/// A field reference into a subject data snapshot.
///
/// The primary `path` is a dotted path (e.g.
/// `last_ultrasound.left_ovary.follicle_count`). When it resolves to
/// nothing, `fallbacks` are tried in declaration order until one yields a
/// non-missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
  pub path: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub fallbacks: Vec<String>,
}

impl FieldRef {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      fallbacks: Vec::new(),
    }
  }

  pub fn with_fallbacks(path: impl Into<String>, fallbacks: Vec<String>) -> Self {
    Self {
      path: path.into(),
      fallbacks,
    }
  }

  /// All candidate paths, primary first.
  pub fn candidates(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.path.as_str()).chain(self.fallbacks.iter().map(String::as_str))
  }
}

/// Comparison operator applied between a resolved field and the condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
  #[serde(rename = ">")]
  Gt,
  #[serde(rename = "<")]
  Lt,
  #[serde(rename = ">=")]
  Gte,
  #[serde(rename = "<=")]
  Lte,
  #[serde(rename = "==")]
  Eq,
  #[serde(rename = "!=")]
  Neq,
  #[serde(rename = "contains")]
  Contains,
  #[serde(rename = "not_contains")]
  NotContains,
}

/// The comparison value of a condition.
///
/// A closed union rather than a raw JSON value; validation rejects
/// authoring errors like a tolerance attached to a text value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Number(f64),
  Flag(bool),
  Text(String),
}

impl FieldValue {
  pub fn as_number(&self) -> Option<f64> {
    match self {
      FieldValue::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn is_numeric(&self) -> bool {
    matches!(self, FieldValue::Number(_))
  }
}

/// How a condition folds into the running result of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
  And,
  Or,
}

/// A time window anchored on a named snapshot event.
///
/// The elapsed whole days between the event timestamp and the snapshot's
/// `taken_at` must fall inside the window for the condition to hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConstraint {
  /// Event name looked up in the snapshot's event map (e.g. `last_injection`).
  pub since_event: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub within_days: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exact_days: Option<i64>,
}

/// A single data-driven condition.
///
/// Missing data is governed by `skip_if_missing`: when true, a missing
/// field makes the condition vacuously true; when false the condition
/// fails closed (false, never "unknown").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
  pub condition_id: String,
  pub field: FieldRef,
  pub operator: CompareOp,
  pub value: FieldValue,
  /// `|resolved - value| <= tolerance` satisfies `==` for numeric fields.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tolerance: Option<f64>,
  /// Authoring metadata only; no unit conversion happens at runtime.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub unit: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub time_constraint: Option<TimeConstraint>,
  #[serde(default)]
  pub skip_if_missing: bool,
  /// How this condition combines with the running chain result.
  /// Ignored on the first condition of a chain; defaults to `and`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub logical_operator: Option<LogicalOperator>,
}

impl Condition {
  /// The operator used when folding this condition into a chain.
  pub fn chain_operator(&self) -> LogicalOperator {
    self.logical_operator.unwrap_or(LogicalOperator::And)
  }
}

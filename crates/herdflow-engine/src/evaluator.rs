//! Condition evaluation.
//!
//! Pure functions of a condition and a snapshot; no side effects.
//! Missing data never produces "unknown": with `skip_if_missing` a
//! missing field is vacuously true, otherwise the condition fails closed.

use herdflow_protocol::{CompareOp, Condition, FieldValue, LogicalOperator, Snapshot};

/// Evaluate a single condition against a snapshot.
pub fn evaluate(condition: &Condition, snapshot: &Snapshot) -> bool {
  let Some(resolved) = snapshot.resolve_field(&condition.field) else {
    return condition.skip_if_missing;
  };

  // A time constraint gates the whole condition: the named event must be
  // present and inside the window, or the value match does not count.
  if let Some(tc) = &condition.time_constraint {
    let Some(elapsed) = snapshot.days_since_event(&tc.since_event) else {
      return false;
    };
    if let Some(within) = tc.within_days
      && !(0..=within).contains(&elapsed)
    {
      return false;
    }
    if let Some(exact) = tc.exact_days
      && elapsed != exact
    {
      return false;
    }
  }

  compare(resolved, condition)
}

/// Evaluate a chained list of conditions, folding left-to-right.
///
/// Each condition after the first combines with the running result via
/// its own declared `and`/`or`; there is no precedence beyond the fold.
/// An empty chain is vacuously true (an unconditional path).
pub fn evaluate_chain(conditions: &[Condition], snapshot: &Snapshot) -> bool {
  let mut iter = conditions.iter();
  let Some(first) = iter.next() else {
    return true;
  };

  let mut result = evaluate(first, snapshot);
  for condition in iter {
    let current = evaluate(condition, snapshot);
    result = match condition.chain_operator() {
      LogicalOperator::And => result && current,
      LogicalOperator::Or => result || current,
    };
  }
  result
}

fn compare(resolved: &serde_json::Value, condition: &Condition) -> bool {
  match condition.operator {
    CompareOp::Gt => numeric_cmp(resolved, condition, |a, b| a > b),
    CompareOp::Lt => numeric_cmp(resolved, condition, |a, b| a < b),
    CompareOp::Gte => numeric_cmp(resolved, condition, |a, b| a >= b),
    CompareOp::Lte => numeric_cmp(resolved, condition, |a, b| a <= b),
    CompareOp::Eq => equals(resolved, &condition.value, condition.tolerance),
    CompareOp::Neq => !equals(resolved, &condition.value, condition.tolerance),
    CompareOp::Contains => contains(resolved, &condition.value),
    CompareOp::NotContains => !contains(resolved, &condition.value),
  }
}

/// Ordering comparisons require both sides numeric; anything else fails
/// closed.
fn numeric_cmp(
  resolved: &serde_json::Value,
  condition: &Condition,
  cmp: impl Fn(f64, f64) -> bool,
) -> bool {
  match (resolved.as_f64(), condition.value.as_number()) {
    (Some(a), Some(b)) => cmp(a, b),
    _ => false,
  }
}

fn equals(resolved: &serde_json::Value, value: &FieldValue, tolerance: Option<f64>) -> bool {
  match value {
    FieldValue::Number(expected) => match resolved.as_f64() {
      Some(actual) => (actual - expected).abs() <= tolerance.unwrap_or(0.0),
      None => false,
    },
    FieldValue::Flag(expected) => resolved.as_bool() == Some(*expected),
    FieldValue::Text(expected) => resolved.as_str() == Some(expected.as_str()),
  }
}

/// `contains` over string fields (substring) and array fields (element
/// equality).
fn contains(resolved: &serde_json::Value, value: &FieldValue) -> bool {
  match resolved {
    serde_json::Value::String(s) => match value {
      FieldValue::Text(needle) => s.contains(needle.as_str()),
      _ => false,
    },
    serde_json::Value::Array(items) => items.iter().any(|item| equals(item, value, None)),
    _ => false,
  }
}

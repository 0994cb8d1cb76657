//! Value-equivalence rules shared by convergence and audit.
//!
//! Transports disagree about types (`"6"` vs `6`, `"true"` vs `true`), so both
//! sides are normalized before comparison. Only the desired keys are
//! compared; extra fields reported by the target are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::core::types::FieldMap;

const RELATIVE_EPSILON: f64 = 1e-9;

/// Desired vs observed value for a field that does not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub desired: Value,
    pub actual: Option<Value>,
}

pub type FieldDiffs = BTreeMap<String, FieldDiff>;

/// Canonical form of a value for comparison purposes.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::String(raw) => normalize_str(raw),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), normalize(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn normalize_str(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(int) = trimmed.parse::<u64>() {
        return Value::Number(int.into());
    }
    // Out-of-range integers compare as exact text; a float would round them.
    if is_integer_literal(trimmed) {
        return Value::String(trimmed.to_string());
    }
    if let Some(number) = trimmed
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .and_then(Number::from_f64)
    {
        return Value::Number(number);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "yes" => Value::Bool(true),
        "false" | "no" => Value::Bool(false),
        _ => Value::String(trimmed.to_string()),
    }
}

fn is_integer_literal(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit())
}

/// True if `actual` satisfies `desired` after normalization.
///
/// A missing actual value is treated as `null`.
pub fn values_equivalent(desired: &Value, actual: Option<&Value>) -> bool {
    let desired = normalize(desired);
    let actual = actual.map(normalize).unwrap_or(Value::Null);
    equivalent(&desired, &actual)
}

fn equivalent(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Number(left), Value::Number(right)) => numbers_equal(left, right),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right.iter())
                    .all(|(left, right)| equivalent(left, right))
        }
        (Value::Object(left), Value::Object(right)) => left.iter().all(|(key, value)| {
            equivalent(value, right.get(key).unwrap_or(&Value::Null))
        }),
        (left, right) => left == right,
    }
}

fn numbers_equal(left: &Number, right: &Number) -> bool {
    if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
        return left == right;
    }
    if let (Some(left), Some(right)) = (left.as_u64(), right.as_u64()) {
        return left == right;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => {
            let scale = left.abs().max(right.abs()).max(1.0);
            (left - right).abs() <= RELATIVE_EPSILON * scale
        }
        _ => false,
    }
}

/// Fields of `desired` whose values are not matched by `actual`.
pub fn diff_fields(desired: &FieldMap, actual: &FieldMap) -> FieldDiffs {
    desired
        .iter()
        .filter(|(name, value)| !values_equivalent(value, actual.get(*name)))
        .map(|(name, value)| {
            (
                name.clone(),
                FieldDiff {
                    desired: value.clone(),
                    actual: actual.get(name).cloned(),
                },
            )
        })
        .collect()
}

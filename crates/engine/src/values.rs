//! Cell value helpers shared by rule evaluation and aggregation.

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Returns the numeric value of a JSON number. Strings are never coerced.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

/// Converts a computed number back into a cell, emitting integers when the value is integral.
pub fn number_value(number: f64) -> Value {
    if number.is_finite() && number.fract() == 0.0 && number.abs() <= MAX_EXACT_INTEGER {
        return Value::from(number as i64);
    }
    Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null)
}

/// JSON equality with numeric normalisation, so `10 == 10.0`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(left), Some(right)) => left == right,
        _ => left == right,
    }
}

/// Orders numbers numerically and strings lexicographically. Other pairs are unordered.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(left), Some(right)) = (as_number(left), as_number(right)) {
        return left.partial_cmp(&right);
    }
    match (left, right) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

/// Null, or a string with no visible characters.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// Truthiness used by `&&`, `||`, `!`, and bare operands.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a cell for messages and generated column names.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Canonical grouping key for a tuple of cells; numerically equal cells share a key.
pub fn group_key<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    let normalized: Vec<Value> = values
        .into_iter()
        .map(|value| match as_number(value) {
            Some(number) => number_value(number),
            None => value.clone(),
        })
        .collect();
    Value::Array(normalized).to_string()
}

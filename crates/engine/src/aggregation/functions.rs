//! Aggregation function registry.
//!
//! Functions receive every cell of their input column for one partition. Numeric functions skip
//! anything that is not a JSON number; `COUNT` counts rows regardless of content.
//!
//! `SUM` and `AVG` add integers exactly, past the 2^53 limit of `f64`, as long as every number
//! in the partition is an integer. Once a decimal is present the arithmetic is binary `f64`, so
//! decimal results carry the usual representation error (`0.1 + 0.2` is not `0.3`).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regflow_types::ColumnType;
use serde_json::Value;

use crate::values::{as_number, group_key, number_value};

pub type AggregateFn = Arc<dyn Fn(&[&Value]) -> Value + Send + Sync>;

/// Declared type of a function's output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Fixed(ColumnType),
    /// The input column's type when it is numeric, decimal otherwise.
    Numeric,
}

impl ResultType {
    pub fn resolve(self, input: Option<ColumnType>) -> ColumnType {
        match self {
            ResultType::Fixed(column_type) => column_type,
            ResultType::Numeric => input.filter(|column_type| column_type.is_numeric()).unwrap_or(ColumnType::Decimal),
        }
    }
}

#[derive(Clone)]
pub struct AggregateFunction {
    pub result_type: ResultType,
    pub call: AggregateFn,
}

/// Functions keyed by upper-cased name; lookups are case-insensitive.
#[derive(Clone, Default)]
pub struct AggregationFunctions {
    functions: HashMap<String, AggregateFunction>,
}

impl fmt::Debug for AggregationFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_tuple("AggregationFunctions").field(&names).finish()
    }
}

impl AggregationFunctions {
    pub fn with_builtins() -> Self {
        let mut functions = Self::default();
        functions.register("SUM", ResultType::Numeric, |values| {
            integer_sum(values)
                .map(integer_value)
                .unwrap_or_else(|| number_value(numbers(values).sum()))
        });
        functions.register("COUNT", ResultType::Fixed(ColumnType::Integer), |values| Value::from(values.len()));
        functions.register("AVG", ResultType::Fixed(ColumnType::Decimal), average);
        functions.register("MIN", ResultType::Numeric, |values| {
            numbers(values).reduce(f64::min).map(number_value).unwrap_or(Value::Null)
        });
        functions.register("MAX", ResultType::Numeric, |values| {
            numbers(values).reduce(f64::max).map(number_value).unwrap_or(Value::Null)
        });
        functions.register("COUNT_DISTINCT", ResultType::Fixed(ColumnType::Integer), count_distinct);
        functions
    }

    pub fn register<F>(&mut self, name: &str, result_type: ResultType, call: F)
    where
        F: Fn(&[&Value]) -> Value + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_ascii_uppercase(),
            AggregateFunction {
                result_type,
                call: Arc::new(call),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&AggregateFunction> {
        self.functions.get(&name.trim().to_ascii_uppercase())
    }
}

fn numbers<'a>(values: &'a [&'a Value]) -> impl Iterator<Item = f64> + 'a {
    values.iter().filter_map(|value| as_number(value))
}

/// Exact total of the numeric cells, or `None` when one of them is not an integer or the total
/// overflows.
fn integer_sum(values: &[&Value]) -> Option<i128> {
    values
        .iter()
        .filter_map(|value| match value {
            Value::Number(number) => Some(number),
            _ => None,
        })
        .try_fold(0i128, |sum, number| {
            let integer = number.as_i64().map(i128::from).or_else(|| number.as_u64().map(i128::from))?;
            sum.checked_add(integer)
        })
}

fn integer_value(total: i128) -> Value {
    if let Ok(total) = i64::try_from(total) {
        return Value::from(total);
    }
    if let Ok(total) = u64::try_from(total) {
        return Value::from(total);
    }
    number_value(total as f64)
}

fn average(values: &[&Value]) -> Value {
    let count = numbers(values).count();
    if count == 0 {
        return Value::Null;
    }
    match integer_sum(values) {
        Some(total) if total % count as i128 == 0 => integer_value(total / count as i128),
        Some(total) => number_value(total as f64 / count as f64),
        None => number_value(numbers(values).sum::<f64>() / count as f64),
    }
}

fn count_distinct(values: &[&Value]) -> Value {
    let distinct: HashSet<String> = values
        .iter()
        .filter(|value| !value.is_null())
        .map(|value| group_key([*value]))
        .collect();
    Value::from(distinct.len())
}

//! Named functions available to rule conditions.
//!
//! Predicates are evaluated per row against already-resolved argument values. Cross-row checks
//! see the participating rows of a dataset at once and return the positions of the rows that
//! fail. Both registries are open for registration; the built-ins cover the usual regulatory
//! field checks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use indexmap::IndexMap;
use regflow_types::Row;
use serde_json::Value;

use crate::values::{group_key, is_blank, values_equal};

/// Reserved for the regex predicate, whose pattern is compiled with the rule instead of per call.
pub const MATCHES_FUNCTION: &str = "matches";

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

pub type PredicateFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Receives the participating rows and the column arguments; returns failing positions.
pub type CrossRowFn = Arc<dyn Fn(&[&Row], &[String]) -> Vec<usize> + Send + Sync>;

/// Accepted argument counts; `max` of `None` means variadic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exactly(count: usize) -> Self {
        Self {
            min: count,
            max: Some(count),
        }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Self { min, max: Some(max) }
    }

    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{max}"),
            Some(max) => write!(f, "{} to {max}", self.min),
            None => write!(f, "at least {}", self.min),
        }
    }
}

#[derive(Clone)]
pub struct Predicate {
    pub arity: Arity,
    pub call: PredicateFn,
}

#[derive(Clone)]
pub struct CrossRowCheck {
    pub arity: Arity,
    pub call: CrossRowFn,
}

/// Predicate and cross-row registries consulted when rules are compiled.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    predicates: HashMap<String, Predicate>,
    cross_row: HashMap<String, CrossRowCheck>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut predicates: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        let mut cross_row: Vec<&str> = self.cross_row.keys().map(String::as_str).collect();
        predicates.sort_unstable();
        cross_row.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("predicates", &predicates)
            .field("cross_row", &cross_row)
            .finish()
    }
}

impl FunctionRegistry {
    /// An empty registry. `matches` is still understood because the compiler handles it.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_predicate("required", Arity::exactly(1), |args| Value::Bool(!is_blank(&args[0])));
        registry.register_predicate("is_null", Arity::exactly(1), |args| Value::Bool(args[0].is_null()));
        registry.register_predicate("is_number", Arity::exactly(1), |args| Value::Bool(args[0].is_number()));
        registry.register_predicate("is_date", Arity::between(1, 2), is_date);
        registry.register_predicate("one_of", Arity::exactly(2), one_of);
        registry.register_predicate("len", Arity::exactly(1), length);
        registry.register_predicate("starts_with", Arity::exactly(2), starts_with);
        registry.register_cross_row("unique", Arity::at_least(1), unique);
        registry.register_cross_row("consistent", Arity::exactly(2), consistent);
        registry
    }

    /// Registers or replaces a row predicate. The callback only sees argument lists that satisfy
    /// `arity`.
    pub fn register_predicate<F>(&mut self, name: impl Into<String>, arity: Arity, call: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.predicates.insert(
            name.into(),
            Predicate {
                arity,
                call: Arc::new(call),
            },
        );
    }

    pub fn register_cross_row<F>(&mut self, name: impl Into<String>, arity: Arity, call: F)
    where
        F: Fn(&[&Row], &[String]) -> Vec<usize> + Send + Sync + 'static,
    {
        self.cross_row.insert(
            name.into(),
            CrossRowCheck {
                arity,
                call: Arc::new(call),
            },
        );
    }

    pub fn predicate(&self, name: &str) -> Option<&Predicate> {
        self.predicates.get(name)
    }

    pub fn cross_row(&self, name: &str) -> Option<&CrossRowCheck> {
        self.cross_row.get(name)
    }
}

fn is_date(args: &[Value]) -> Value {
    let format = args.get(1).and_then(Value::as_str).unwrap_or(DEFAULT_DATE_FORMAT);
    let parsed = args[0]
        .as_str()
        .is_some_and(|text| NaiveDate::parse_from_str(text.trim(), format).is_ok());
    Value::Bool(parsed)
}

fn one_of(args: &[Value]) -> Value {
    let Value::Array(allowed) = &args[1] else {
        return Value::Bool(values_equal(&args[0], &args[1]));
    };
    Value::Bool(allowed.iter().any(|candidate| values_equal(&args[0], candidate)))
}

fn length(args: &[Value]) -> Value {
    let length = match &args[0] {
        Value::Null => 0,
        Value::String(text) => text.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => other.to_string().chars().count(),
    };
    Value::from(length)
}

fn starts_with(args: &[Value]) -> Value {
    match (&args[0], &args[1]) {
        (Value::String(text), Value::String(prefix)) => Value::Bool(text.starts_with(prefix.as_str())),
        _ => Value::Bool(false),
    }
}

/// Every row whose key tuple appears more than once fails.
fn unique(rows: &[&Row], columns: &[String]) -> Vec<usize> {
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (position, row) in rows.iter().enumerate() {
        let key = group_key(columns.iter().map(|column| row.get(column)));
        groups.entry(key).or_default().push(position);
    }
    let mut failing: Vec<usize> = groups
        .into_values()
        .filter(|positions| positions.len() > 1)
        .flatten()
        .collect();
    failing.sort_unstable();
    failing
}

/// Rows sharing `columns[0]` must agree on `columns[1]`; every row of a disagreeing group fails.
fn consistent(rows: &[&Row], columns: &[String]) -> Vec<usize> {
    let (key_column, value_column) = (&columns[0], &columns[1]);
    let mut groups: IndexMap<String, (Vec<usize>, Vec<String>)> = IndexMap::new();
    for (position, row) in rows.iter().enumerate() {
        let (positions, values) = groups.entry(group_key([row.get(key_column)])).or_default();
        positions.push(position);
        let value = group_key([row.get(value_column)]);
        if !values.contains(&value) {
            values.push(value);
        }
    }
    let mut failing: Vec<usize> = groups
        .into_values()
        .filter(|(_, values)| values.len() > 1)
        .flat_map(|(positions, _)| positions)
        .collect();
    failing.sort_unstable();
    failing
}

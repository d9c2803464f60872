//! Aggregation rule configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Strategy applied by an aggregation rule.
///
/// Unrecognized names are preserved rather than rejected at parse time so the engine can report
/// them as configuration errors with the offending name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AggregationKind {
    GroupBy,
    Pivot,
    Window,
    Custom,
    Unrecognized(String),
}

impl From<String> for AggregationKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "GROUP_BY" | "GROUPBY" => AggregationKind::GroupBy,
            "PIVOT" => AggregationKind::Pivot,
            "WINDOW" => AggregationKind::Window,
            "CUSTOM" => AggregationKind::Custom,
            _ => AggregationKind::Unrecognized(value),
        }
    }
}

impl From<AggregationKind> for String {
    fn from(value: AggregationKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationKind::GroupBy => f.write_str("GROUP_BY"),
            AggregationKind::Pivot => f.write_str("PIVOT"),
            AggregationKind::Window => f.write_str("WINDOW"),
            AggregationKind::Custom => f.write_str("CUSTOM"),
            AggregationKind::Unrecognized(name) => f.write_str(name),
        }
    }
}

/// One `(input, output, function)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationColumn {
    pub input: String,
    pub output: String,
    pub function: String,
}

impl AggregationColumn {
    pub fn new(input: impl Into<String>, output: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            function: function.into(),
        }
    }
}

/// An ordered aggregation step; rule N's output is rule N+1's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AggregationKind,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub columns: Vec<AggregationColumn>,
    /// PIVOT: column whose distinct values become output columns.
    #[serde(default)]
    pub pivot_column: Option<String>,
    /// WINDOW: when set, outputs are running aggregates in this column's order.
    #[serde(default)]
    pub order_by: Option<String>,
    /// CUSTOM: name of the registered handler.
    #[serde(default)]
    pub custom: Option<String>,
}

impl AggregationRule {
    pub fn group_by(id: impl Into<String>, keys: &[&str], columns: Vec<AggregationColumn>) -> Self {
        Self {
            id: id.into(),
            kind: AggregationKind::GroupBy,
            group_by: keys.iter().map(|key| key.to_string()).collect(),
            columns,
            pivot_column: None,
            order_by: None,
            custom: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_keeps_its_name() {
        let rule: AggregationRule = serde_yaml::from_str(
            r#"
id: totals
type: rollup
group_by: [desk]
"#,
        )
        .expect("rule");
        assert_eq!(rule.kind, AggregationKind::Unrecognized("rollup".into()));
        assert_eq!(rule.kind.to_string(), "rollup");
    }

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!(AggregationKind::from("group-by".to_string()), AggregationKind::GroupBy);
        assert_eq!(AggregationKind::from("Window".to_string()), AggregationKind::Window);
    }
}

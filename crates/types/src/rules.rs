//! Validation rule configuration and the outcome types produced by rule evaluation.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::RowId;

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleScope {
    /// A single column of a single row.
    #[serde(alias = "field")]
    Field,
    /// Any columns of a single row.
    #[serde(alias = "row")]
    Row,
    /// Relationships between rows of the whole dataset.
    #[serde(alias = "cross_row")]
    CrossRow,
}

/// Whether a failing rule removes the row from the reportable set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Failure excludes the row from the validated dataset.
    #[default]
    Error,
    /// Failure is reported for review only.
    Warning,
}

/// A declarative validation rule as authored in report configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub scope: RuleScope,
    /// Column a FIELD rule is bound to.
    #[serde(default)]
    pub field: Option<String>,
    /// Expression that must hold for the row (or dataset) to pass.
    pub condition: String,
    /// Applicability guard; rows where it does not hold are not evaluated.
    #[serde(default)]
    pub when: Option<String>,
    /// Failure message; may interpolate `${{ column }}` references.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: Option<String>,
}

/// Columns Operations staff may edit after extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustableColumnSpec {
    columns: IndexSet<String>,
}

impl AdjustableColumnSpec {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_adjustable(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }
}

/// One failed rule for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule_id: String,
    pub message: String,
}

impl RuleFailure {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

/// Mapping from row to its ordered rule failures. Rows without entries passed every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationOutcome {
    failures: IndexMap<RowId, Vec<RuleFailure>>,
}

impl ValidationOutcome {
    pub fn record(&mut self, row_id: RowId, failure: RuleFailure) {
        self.failures.entry(row_id).or_default().push(failure);
    }

    pub fn failures_for(&self, row_id: &RowId) -> &[RuleFailure] {
        self.failures.get(row_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A row is reportable exactly when it has no recorded failure.
    pub fn is_reportable(&self, row_id: &RowId) -> bool {
        self.failures_for(row_id).is_empty()
    }

    pub fn failing_row_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowId, &[RuleFailure])> {
        self.failures.iter().map(|(row_id, failures)| (row_id, failures.as_slice()))
    }
}

/// Audit summary of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    /// Blocking failures; these rows are excluded from the validated dataset.
    pub outcome: ValidationOutcome,
    /// Warning-severity failures; informational only.
    #[serde(default)]
    pub warnings: ValidationOutcome,
}

/// A manual correction requested by Operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnEdit {
    pub row_id: RowId,
    pub column: String,
    pub value: Value,
}

impl ColumnEdit {
    pub fn new(row_id: impl Into<RowId>, column: impl Into<String>, value: Value) -> Self {
        Self {
            row_id: row_id.into(),
            column: column.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_scope_accepts_upper_and_lower_case() {
        let rule: ValidationRule = serde_yaml::from_str(
            r#"
id: cp_lei
scope: cross_row
condition: "unique(trade_id)"
"#,
        )
        .expect("rule");
        assert_eq!(rule.scope, RuleScope::CrossRow);
        assert_eq!(rule.severity, Severity::Error);

        let scope: RuleScope = serde_json::from_str("\"FIELD\"").expect("scope");
        assert_eq!(scope, RuleScope::Field);
    }
}

//! Error types for the reporting engine.
//!
//! Configuration problems are fatal and surface before any step runs. Row-level rule failures are
//! not errors at all; they are recorded in the validation outcome. Reprocessing errors reject a
//! single adjustment request, and execution errors stop a run at the current level boundary.

use std::fmt;

use thiserror::Error;

use crate::workflow::WorkflowContext;

/// A dependency cycle, listed from the first step revisited back to itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CycleError {
    pub path: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle detected in workflow steps: {}", self.path.join(" -> "))
    }
}

/// Invalid report or workflow configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("duplicate step identifier detected: '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("invalid configuration for step '{step_id}': {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    #[error("no handler registered for custom step '{step_id}' (handler '{handler}')")]
    UnknownStepHandler { step_id: String, handler: String },

    #[error("malformed validation rule '{rule_id}': {reason}")]
    MalformedRule { rule_id: String, reason: String },

    #[error("unknown aggregation function '{function}' in rule '{rule_id}'")]
    UnknownAggregationFunction { rule_id: String, function: String },

    #[error("unknown aggregation type '{kind}' in rule '{rule_id}'")]
    UnknownAggregationType { rule_id: String, kind: String },

    #[error("malformed aggregation rule '{rule_id}': {reason}")]
    MalformedAggregation { rule_id: String, reason: String },

    #[error("workflow '{workflow_id}' could not be loaded: {reason}")]
    WorkflowUnavailable { workflow_id: String, reason: String },

    #[error("report '{report_id}' could not be loaded: {reason}")]
    ReportUnavailable { report_id: String, reason: String },
}

impl ConfigurationError {
    pub fn malformed_rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRule {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_step_config(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStepConfig {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_aggregation(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedAggregation {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }
}

/// Failure while applying aggregation rules.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("custom aggregation '{rule_id}' failed: {source:#}")]
    Handler {
        rule_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Rejection of a manual adjustment. The stored validation state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReprocessingError {
    #[error("column '{column}' of row '{row_id}' is not adjustable in dataset '{dataset_id}'")]
    NonAdjustableColumn {
        dataset_id: String,
        row_id: String,
        column: String,
    },

    #[error("no validated dataset '{dataset_id}' is available for reprocessing")]
    UnknownDataset { dataset_id: String },

    #[error("row '{row_id}' does not exist in dataset '{dataset_id}'")]
    UnknownRow { dataset_id: String, row_id: String },

    #[error("column '{column}' does not exist in dataset '{dataset_id}'")]
    UnknownColumn { dataset_id: String, column: String },
}

/// A step failed; the run stopped at the end of that step's level.
#[derive(Debug, Error)]
#[error("workflow run '{run_id}' failed at step '{step_id}': {source:#}")]
pub struct WorkflowExecutionError {
    pub run_id: String,
    pub step_id: String,
    #[source]
    pub source: anyhow::Error,
    /// Final state of the run, including outputs of the steps that did finish.
    pub context: Box<WorkflowContext>,
}

/// Everything `execute_workflow` can fail with.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Execution(#[from] WorkflowExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_path() {
        let error = CycleError {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "cycle detected in workflow steps: a -> b -> a");

        let wrapped: ConfigurationError = error.into();
        assert!(matches!(wrapped, ConfigurationError::Cycle(_)));
        assert!(wrapped.to_string().starts_with("cycle detected"));
    }

    #[test]
    fn helper_constructors_fill_fields() {
        let error = ConfigurationError::malformed_rule("r1", "unknown function 'nope'");
        assert!(matches!(error, ConfigurationError::MalformedRule { ref rule_id, .. } if rule_id == "r1"));
        assert_eq!(error.to_string(), "malformed validation rule 'r1': unknown function 'nope'");
    }
}

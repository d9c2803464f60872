//! Printable views of engine results.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regflow_engine::workflow::{ExecutionPlan, StepFailure};
use regflow_engine::{RunStatus, StepStatus, ValidationResult, WorkflowContext};
use regflow_types::ValidationSummary;
use serde::Serialize;

use crate::cli::OutputFormat;

pub fn print<T: Serialize>(format: OutputFormat, value: &T) -> Result<()> {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    };
    println!("{rendered}");
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    run_id: &'a str,
    workflow_id: &'a str,
    report_id: &'a str,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    steps: IndexMap<&'a str, StepSummary<'a>>,
    validation: IndexMap<&'a str, ValidationCounts>,
    artifacts: IndexMap<&'a str, &'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a StepFailure>,
}

#[derive(Debug, Serialize)]
struct StepSummary<'a> {
    level: usize,
    status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ValidationCounts {
    total_rows: usize,
    valid_rows: usize,
    invalid_rows: usize,
    rows_with_warnings: usize,
}

impl From<&ValidationSummary> for ValidationCounts {
    fn from(summary: &ValidationSummary) -> Self {
        Self {
            total_rows: summary.total_rows,
            valid_rows: summary.valid_rows,
            invalid_rows: summary.invalid_rows,
            rows_with_warnings: summary.warnings.failing_row_count(),
        }
    }
}

impl<'a> RunSummary<'a> {
    pub fn new(context: &'a WorkflowContext) -> Self {
        Self {
            run_id: &context.run_id,
            workflow_id: &context.workflow_id,
            report_id: &context.report_id,
            status: context.status,
            started_at: context.started_at,
            finished_at: context.finished_at,
            steps: context
                .steps
                .iter()
                .map(|(step_id, record)| {
                    let summary = StepSummary {
                        level: record.level,
                        status: record.status,
                        error: record.error.as_deref(),
                    };
                    (step_id.as_str(), summary)
                })
                .collect(),
            validation: context
                .validation_results()
                .map(|(step_id, result)| (step_id, ValidationCounts::from(&result.summary)))
                .collect(),
            artifacts: context.artifacts().map(|(step_id, path)| (step_id, path.as_path())).collect(),
            error: context.error.as_ref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlanSummary<'a> {
    workflow_id: &'a str,
    report_id: &'a str,
    levels: &'a [Vec<String>],
    steps: IndexMap<&'a str, &'static str>,
    validation_rules: usize,
    aggregation_rules: Vec<&'a str>,
}

impl<'a> PlanSummary<'a> {
    pub fn new(plan: &'a ExecutionPlan) -> Self {
        Self {
            workflow_id: &plan.workflow.workflow_id,
            report_id: &plan.report.report_id,
            levels: &plan.levels,
            steps: plan.workflow.steps.iter().map(|step| (step.id.as_str(), step.kind.as_str())).collect(),
            validation_rules: plan.rules.len(),
            aggregation_rules: plan.report.aggregation_rules.iter().map(|rule| rule.id.as_str()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ValidationReport<'a> {
    dataset_id: &'a str,
    adjustments_applied: usize,
    summary: &'a ValidationSummary,
}

impl<'a> ValidationReport<'a> {
    pub fn new(result: &'a ValidationResult, adjustments_applied: usize) -> Self {
        Self {
            dataset_id: result.dataset_id.as_str(),
            adjustments_applied,
            summary: &result.summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regflow_engine::RunInfo;
    use regflow_types::{RowId, RuleFailure, StepKind, WorkflowDefinition, WorkflowStep};
    use serde_json::Map as JsonMap;

    #[test]
    fn run_summary_reports_levels_and_pending_steps() {
        let workflow = WorkflowDefinition {
            workflow_id: "daily".into(),
            report_id: "emir".into(),
            description: None,
            steps: vec![
                WorkflowStep::new("extract", StepKind::Extraction),
                WorkflowStep::new("validate", StepKind::Validation).depends_on(["extract"]),
            ],
        };
        let run = RunInfo {
            run_id: "run-1".into(),
            workflow_id: "daily".into(),
            report_id: "emir".into(),
            parameters: JsonMap::new(),
        };
        let context = WorkflowContext::new(&run, &workflow, &[vec!["extract".into()], vec!["validate".into()]]);

        let value = serde_json::to_value(RunSummary::new(&context)).expect("serialize");
        let steps: Vec<&String> = value["steps"].as_object().expect("steps").keys().collect();
        assert_eq!(steps, vec!["extract", "validate"]);
        assert_eq!(value["steps"]["validate"]["level"], 1);
        assert_eq!(value["steps"]["validate"]["status"], "PENDING");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn validation_counts_include_warning_rows() {
        let mut summary = ValidationSummary {
            total_rows: 3,
            valid_rows: 2,
            invalid_rows: 1,
            ..Default::default()
        };
        summary.warnings.record(RowId::new("2"), RuleFailure::new("notional_positive", "rule 'notional_positive' failed"));
        let counts = ValidationCounts::from(&summary);
        assert_eq!(counts.rows_with_warnings, 1);
        assert_eq!(counts.valid_rows, 2);
    }
}

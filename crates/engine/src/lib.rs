//! # Regflow Engine
//!
//! The configuration-driven core of the regflow reporting pipeline. One engine produces many
//! regulator-specific reports: everything report specific lives in a [`ReportConfig`] and a
//! [`WorkflowDefinition`], never in code.
//!
//! ## Key Features
//!
//! - **Dependency leveling**: workflow steps are grouped into levels that may run concurrently
//! - **Declarative rules**: FIELD, ROW, and CROSS_ROW validation rules written in a small
//!   condition language backed by a registry of named predicates
//! - **Reportability**: rows without blocking failures form the validated dataset, and manual
//!   corrections to adjustable columns are re-validated in place
//! - **Aggregation**: GROUP_BY, PIVOT, WINDOW, and CUSTOM rules applied in sequence
//!
//! ## Usage
//!
//! ```rust
//! use regflow_engine::ReportabilityResolver;
//! use regflow_types::{AdjustableColumnSpec, Column, ColumnType, Dataset, Row, RuleScope, Schema, Severity, ValidationRule};
//! use serde_json::json;
//!
//! let dataset = Dataset::new("trades", Schema::new(vec![Column::new("lei", ColumnType::String)]))
//!     .with_rows(vec![Row::new("1").with("lei", json!("L1")), Row::new("2")]);
//! let rule = ValidationRule {
//!     id: "lei_required".into(),
//!     scope: RuleScope::Field,
//!     field: Some("lei".into()),
//!     condition: "required(lei)".into(),
//!     when: None,
//!     message: None,
//!     severity: Severity::Error,
//!     description: None,
//! };
//!
//! let resolver = ReportabilityResolver::default();
//! let result = resolver.validate(&dataset, &[rule], &AdjustableColumnSpec::new(["lei"]))?;
//! assert_eq!(result.summary.valid_rows, 1);
//! assert_eq!(result.summary.invalid_rows, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`graph`**: dependency graph, cycle detection, and leveling
//! - **`rules`**: condition syntax, function registries, compilation, and evaluation
//! - **`resolver`**: validated datasets, summaries, and adjustment reprocessing
//! - **`aggregation`**: aggregation functions and strategies
//! - **`workflow`**: the orchestrator, step types, run context, and collaborator traits

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

pub mod aggregation;
pub mod error;
pub mod graph;
pub mod resolver;
pub mod rules;
pub mod templates;
pub mod values;
pub mod workflow;

pub use aggregation::{AggregationFunctions, AggregationPipeline, CustomAggregation};
pub use error::{AggregationError, ConfigurationError, CycleError, ReprocessingError, WorkflowError, WorkflowExecutionError};
pub use graph::DependencyGraph;
pub use regflow_types::{ReportConfig, WorkflowDefinition};
pub use resolver::{ReportabilityResolver, ValidationResult};
pub use rules::{Arity, CompiledRuleSet, FunctionRegistry, RuleSetCache};
pub use workflow::{
    ConfigurationSource, DataExtractor, ExecutionPlan, ReportRenderer, RunInfo, RunStatus, StepHandler, StepInput, StepOutput, StepStatus,
    WorkflowContext, WorkflowEngine, WorkflowEngineBuilder,
};

/// Loads a YAML or JSON configuration document.
///
/// YAML is a superset of JSON, so one parser covers both formats regardless of extension.
pub fn parse_document_file<T>(file_path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned,
{
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read document: {}", file_path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse document: {}", file_path.display()))
}

/// Loads a report configuration file.
pub fn parse_report_file(file_path: impl AsRef<Path>) -> Result<ReportConfig> {
    parse_document_file(file_path)
}

/// Loads a workflow definition file.
pub fn parse_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    parse_document_file(file_path)
}

//! Workflow and report configuration documents.
//!
//! These are the per-report inputs a configuration collaborator supplies to the engine. They are
//! treated as immutable for the duration of a run. Authoring order is preserved everywhere so
//! levels, rule evaluation, and error messages stay deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::aggregation::AggregationRule;
use crate::dataset::Schema;
use crate::rules::{AdjustableColumnSpec, ValidationRule};

/// Built-in step types plus the registration-extensible `custom` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Extraction,
    Validation,
    Aggregation,
    Rendering,
    Custom,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Extraction => "extraction",
            StepKind::Validation => "validation",
            StepKind::Aggregation => "aggregation",
            StepKind::Rendering => "rendering",
            StepKind::Custom => "custom",
        }
    }
}

/// One node of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Step-type specific configuration, decoded by the engine before the run starts.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: Value::Null,
            depends_on: Vec::new(),
            description: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

/// The full step set of a report workflow. Must be acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub report_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }
}

/// Where an extraction step reads its rows from. Opaque to the engine beyond `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    /// Column whose value becomes the row id; the 1-based row number otherwise.
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub options: JsonMap<String, Value>,
}

/// Everything the engine needs to produce one regulator-specific report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub report_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceDescriptor>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default)]
    pub aggregation_rules: Vec<AggregationRule>,
    #[serde(default)]
    pub adjustable_columns: AdjustableColumnSpec,
    #[serde(default)]
    pub output_format: Option<String>,
}

impl ReportConfig {
    pub fn data_source(&self, name: &str) -> Option<&DataSourceDescriptor> {
        self.data_sources.iter().find(|source| source.name == name)
    }
}

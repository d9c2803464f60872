//! Seams to the outside world.
//!
//! The engine never reads files, databases, or templates itself. Extraction, configuration
//! loading, and rendering are delegated through these traits; `regflow-util` ships file-backed
//! implementations and the in-memory versions below serve embedding and tests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use regflow_types::{DataSourceDescriptor, Dataset, ReportConfig, WorkflowDefinition};
use serde_json::{Map as JsonMap, Value};

use super::context::RunInfo;

/// Produces the raw rows of one data source.
pub trait DataExtractor: Send + Sync {
    fn extract(&self, source: &DataSourceDescriptor, parameters: &JsonMap<String, Value>) -> Result<Dataset>;
}

/// Supplies report configurations and workflow definitions by id.
pub trait ConfigurationSource: Send + Sync {
    fn report_config(&self, report_id: &str) -> Result<Arc<ReportConfig>>;

    fn workflow_definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>>;

    /// Drops anything cached so later lookups see the current documents.
    fn reload(&self) {}
}

/// Writes a final dataset into an output artifact and returns its location.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, report: &ReportConfig, dataset: &Dataset, run: &RunInfo) -> Result<PathBuf>;
}

/// Configuration held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigSource {
    reports: IndexMap<String, Arc<ReportConfig>>,
    workflows: IndexMap<String, Arc<WorkflowDefinition>>,
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report(mut self, report: ReportConfig) -> Self {
        self.reports.insert(report.report_id.clone(), Arc::new(report));
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.workflows.insert(workflow.workflow_id.clone(), Arc::new(workflow));
        self
    }
}

impl ConfigurationSource for InMemoryConfigSource {
    fn report_config(&self, report_id: &str) -> Result<Arc<ReportConfig>> {
        self.reports
            .get(report_id)
            .cloned()
            .ok_or_else(|| anyhow!("no report configuration named '{report_id}'"))
    }

    fn workflow_definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| anyhow!("no workflow definition named '{workflow_id}'"))
    }
}

/// Serves prepared datasets keyed by data source name.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExtractor {
    datasets: IndexMap<String, Dataset>,
}

impl InMemoryExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, source: impl Into<String>, dataset: Dataset) -> Self {
        self.datasets.insert(source.into(), dataset);
        self
    }
}

impl DataExtractor for InMemoryExtractor {
    fn extract(&self, source: &DataSourceDescriptor, _parameters: &JsonMap<String, Value>) -> Result<Dataset> {
        self.datasets
            .get(&source.name)
            .cloned()
            .ok_or_else(|| anyhow!("no rows prepared for data source '{}'", source.name))
    }
}

//! Run state.
//!
//! The [`WorkflowContext`] is owned by the orchestrator. Steps never see it; they receive an
//! immutable snapshot of their dependencies' outputs and hand back a result that the orchestrator
//! merges here, one completion at a time.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regflow_types::{StepKind, WorkflowDefinition};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};

use super::steps::StepOutput;
use crate::resolver::ValidationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Identity and parameters of a run, shared read-only with every step.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub workflow_id: String,
    pub report_id: String,
    pub parameters: JsonMap<String, Value>,
}

impl RunInfo {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// The reporting date, when the run was started with an `as_of` parameter.
    pub fn as_of(&self) -> Option<&str> {
        self.parameter("as_of").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub kind: StepKind,
    pub level: usize,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Arc<StepOutput>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The failure that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowContext {
    pub run_id: String,
    pub workflow_id: String,
    pub report_id: String,
    pub parameters: JsonMap<String, Value>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub levels: Vec<Vec<String>>,
    pub steps: IndexMap<String, StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl WorkflowContext {
    pub fn new(run: &RunInfo, workflow: &WorkflowDefinition, levels: &[Vec<String>]) -> Self {
        let mut steps = IndexMap::with_capacity(workflow.steps.len());
        for (level, step_ids) in levels.iter().enumerate() {
            for step_id in step_ids {
                let Some(step) = workflow.step(step_id) else {
                    continue;
                };
                steps.insert(
                    step_id.clone(),
                    StepRecord {
                        step_id: step_id.clone(),
                        kind: step.kind,
                        level,
                        status: StepStatus::Pending,
                        started_at: None,
                        finished_at: None,
                        output: None,
                        error: None,
                    },
                );
            }
        }

        Self {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            report_id: run.report_id.clone(),
            parameters: run.parameters.clone(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            levels: levels.to_vec(),
            steps,
            error: None,
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(at);
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.status = if self.error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.finished_at = Some(at);
    }

    pub fn mark_running(&mut self, step_id: &str) {
        if let Some(record) = self.steps.get_mut(step_id) {
            record.status = StepStatus::Running;
        }
    }

    pub fn record_success(&mut self, step_id: &str, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, output: StepOutput) {
        if let Some(record) = self.steps.get_mut(step_id) {
            record.status = StepStatus::Succeeded;
            record.started_at = Some(started_at);
            record.finished_at = Some(finished_at);
            record.output = Some(Arc::new(output));
        }
    }

    /// Marks a step failed. Only the first failure of a run becomes the run's error.
    pub fn record_failure(
        &mut self,
        step_id: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        message: String,
    ) {
        if let Some(record) = self.steps.get_mut(step_id) {
            record.status = StepStatus::Failed;
            record.started_at = started_at;
            record.finished_at = Some(finished_at);
            record.error = Some(message.clone());
        }
        if self.error.is_none() {
            self.error = Some(StepFailure {
                step_id: step_id.to_string(),
                message,
            });
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    pub fn output(&self, step_id: &str) -> Option<&Arc<StepOutput>> {
        self.step(step_id).and_then(|record| record.output.as_ref())
    }

    /// Snapshot of the outputs of `dependencies` that have finished successfully.
    pub fn dependency_outputs<'a>(&self, dependencies: impl IntoIterator<Item = &'a String>) -> IndexMap<String, Arc<StepOutput>> {
        dependencies
            .into_iter()
            .filter_map(|dependency| self.output(dependency).map(|output| (dependency.clone(), output.clone())))
            .collect()
    }

    pub fn validation_results(&self) -> impl Iterator<Item = (&str, &ValidationResult)> {
        self.steps.iter().filter_map(|(step_id, record)| match record.output.as_deref() {
            Some(StepOutput::Validation(result)) => Some((step_id.as_str(), result)),
            _ => None,
        })
    }

    pub fn artifacts(&self) -> impl Iterator<Item = (&str, &PathBuf)> {
        self.steps.iter().filter_map(|(step_id, record)| match record.output.as_deref() {
            Some(StepOutput::Artifact(path)) => Some((step_id.as_str(), path)),
            _ => None,
        })
    }

    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|record| record.status == status).count()
    }
}

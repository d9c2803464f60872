//! Step types and their execution contract.
//!
//! Built-in steps are decoded into a [`StepAction`] before the run starts, so a typo in a step's
//! configuration is a configuration error rather than a failure halfway through a run. Custom
//! steps dispatch by name to a registered [`StepHandler`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use regflow_types::{AggregationRule, DataSourceDescriptor, Dataset, ReportConfig, StepKind, WorkflowStep};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::collaborators::{DataExtractor, ReportRenderer};
use super::context::RunInfo;
use crate::aggregation::AggregationPipeline;
use crate::error::ConfigurationError;
use crate::resolver::{ReportabilityResolver, ValidationResult};
use crate::rules::CompiledRuleSet;

/// What a step hands back to the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    Dataset(Arc<Dataset>),
    Validation(ValidationResult),
    Artifact(PathBuf),
    Value(Value),
}

impl StepOutput {
    /// The dataset a downstream step consumes: extracted or aggregated rows, or validated rows.
    pub fn dataset(&self) -> Option<&Arc<Dataset>> {
        match self {
            StepOutput::Dataset(dataset) => Some(dataset),
            StepOutput::Validation(result) => Some(&result.validated),
            StepOutput::Artifact(_) | StepOutput::Value(_) => None,
        }
    }
}

/// Everything a step may read. Built by the orchestrator; never mutated.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run: Arc<RunInfo>,
    pub step_id: String,
    pub report: Arc<ReportConfig>,
    /// Outputs of the step's declared dependencies, keyed by step id.
    pub dependencies: IndexMap<String, Arc<StepOutput>>,
}

impl StepInput {
    /// Resolves the dataset a step works on.
    ///
    /// With `input` set, that dependency must have produced a dataset. Without it, exactly one
    /// dependency may have.
    pub fn dataset_from(&self, input: Option<&str>) -> Result<Arc<Dataset>> {
        if let Some(input) = input {
            let output = self
                .dependencies
                .get(input)
                .ok_or_else(|| anyhow!("step '{}' has no output from '{input}'", self.step_id))?;
            return output
                .dataset()
                .cloned()
                .ok_or_else(|| anyhow!("step '{input}' did not produce a dataset for step '{}'", self.step_id));
        }

        let mut datasets = self.dependencies.values().filter_map(|output| output.dataset());
        match (datasets.next(), datasets.next()) {
            (Some(dataset), None) => Ok(dataset.clone()),
            (None, _) => bail!("step '{}' has no dependency that produced a dataset", self.step_id),
            (Some(_), Some(_)) => bail!(
                "step '{}' has several dependencies that produced datasets; set `input` in its config",
                self.step_id
            ),
        }
    }
}

/// A registration-extensible step body.
pub trait StepHandler: Send + Sync {
    fn run(&self, input: &StepInput, config: &Value) -> Result<StepOutput>;
}

impl<F> StepHandler for F
where
    F: Fn(&StepInput, &Value) -> Result<StepOutput> + Send + Sync,
{
    fn run(&self, input: &StepInput, config: &Value) -> Result<StepOutput> {
        self(input, config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractionConfig {
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputConfig {
    #[serde(default)]
    input: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregationConfig {
    #[serde(default)]
    input: Option<String>,
    /// Subset of the report's aggregation rule ids, applied in the listed order.
    #[serde(default)]
    rules: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomConfig {
    handler: String,
    #[serde(default)]
    options: Value,
}

/// Shared collaborators used by built-in steps.
#[derive(Clone)]
pub struct StepServices {
    pub extractor: Arc<dyn DataExtractor>,
    pub renderer: Arc<dyn ReportRenderer>,
    pub resolver: Arc<ReportabilityResolver>,
    pub aggregation: Arc<AggregationPipeline>,
}

impl fmt::Debug for StepServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepServices")
            .field("resolver", &self.resolver)
            .field("aggregation", &self.aggregation)
            .finish_non_exhaustive()
    }
}

/// A decoded step, ready to run.
#[derive(Clone)]
pub enum StepAction {
    Extraction {
        source: DataSourceDescriptor,
    },
    Validation {
        input: Option<String>,
        rules: Arc<CompiledRuleSet>,
    },
    Aggregation {
        input: Option<String>,
        rules: Vec<AggregationRule>,
    },
    Rendering {
        input: Option<String>,
    },
    Custom {
        name: String,
        handler: Arc<dyn StepHandler>,
        options: Value,
    },
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Extraction { source } => f.debug_struct("Extraction").field("source", &source.name).finish(),
            StepAction::Validation { input, rules } => f
                .debug_struct("Validation")
                .field("input", input)
                .field("rules", &rules.len())
                .finish(),
            StepAction::Aggregation { input, rules } => f
                .debug_struct("Aggregation")
                .field("input", input)
                .field("rules", &rules.iter().map(|rule| rule.id.as_str()).collect::<Vec<_>>())
                .finish(),
            StepAction::Rendering { input } => f.debug_struct("Rendering").field("input", input).finish(),
            StepAction::Custom { name, options, .. } => {
                f.debug_struct("Custom").field("name", name).field("options", options).finish()
            }
        }
    }
}

impl StepAction {
    /// Decodes a step's configuration against its report.
    pub fn decode(
        step: &WorkflowStep,
        report: &ReportConfig,
        rules: &Arc<CompiledRuleSet>,
        handlers: &HashMap<String, Arc<dyn StepHandler>>,
    ) -> Result<Self, ConfigurationError> {
        match step.kind {
            StepKind::Extraction => {
                let config: ExtractionConfig = decode_config(step)?;
                let source = match config.source.as_deref() {
                    Some(name) => report.data_source(name).ok_or_else(|| {
                        ConfigurationError::invalid_step_config(
                            &step.id,
                            format!("report '{}' has no data source '{name}'", report.report_id),
                        )
                    })?,
                    None => match report.data_sources.as_slice() {
                        [only] => only,
                        sources => {
                            return Err(ConfigurationError::invalid_step_config(
                                &step.id,
                                format!("report defines {} data sources; set `source`", sources.len()),
                            ));
                        }
                    },
                };
                Ok(StepAction::Extraction { source: source.clone() })
            }
            StepKind::Validation => {
                let config: InputConfig = decode_config(step)?;
                check_input(step, config.input.as_deref())?;
                Ok(StepAction::Validation {
                    input: config.input,
                    rules: rules.clone(),
                })
            }
            StepKind::Aggregation => {
                let config: AggregationConfig = decode_config(step)?;
                check_input(step, config.input.as_deref())?;
                let rules = match config.rules {
                    None => report.aggregation_rules.clone(),
                    Some(ids) => ids
                        .iter()
                        .map(|id| {
                            report.aggregation_rules.iter().find(|rule| &rule.id == id).cloned().ok_or_else(|| {
                                ConfigurationError::invalid_step_config(&step.id, format!("unknown aggregation rule '{id}'"))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(StepAction::Aggregation {
                    input: config.input,
                    rules,
                })
            }
            StepKind::Rendering => {
                let config: InputConfig = decode_config(step)?;
                check_input(step, config.input.as_deref())?;
                Ok(StepAction::Rendering { input: config.input })
            }
            StepKind::Custom => {
                let config: CustomConfig = decode_config(step)?;
                let handler = handlers
                    .get(&config.handler)
                    .cloned()
                    .ok_or_else(|| ConfigurationError::UnknownStepHandler {
                        step_id: step.id.clone(),
                        handler: config.handler.clone(),
                    })?;
                Ok(StepAction::Custom {
                    name: config.handler,
                    handler,
                    options: config.options,
                })
            }
        }
    }

    pub fn run(&self, input: &StepInput, services: &StepServices) -> Result<StepOutput> {
        match self {
            StepAction::Extraction { source } => {
                let mut dataset = services
                    .extractor
                    .extract(source, &input.run.parameters)
                    .with_context(|| format!("failed to extract data source '{}'", source.name))?;
                dataset.id = format!("{}/{}", input.run.run_id, input.step_id).into();
                Ok(StepOutput::Dataset(Arc::new(dataset)))
            }
            StepAction::Validation { input: source, rules } => {
                let dataset = input.dataset_from(source.as_deref())?;
                let result = services
                    .resolver
                    .validate_compiled(&dataset, rules.clone(), &input.report.adjustable_columns);
                Ok(StepOutput::Validation(result))
            }
            StepAction::Aggregation { input: source, rules } => {
                let dataset = input.dataset_from(source.as_deref())?;
                let aggregated = services.aggregation.aggregate(&dataset, rules)?;
                Ok(StepOutput::Dataset(Arc::new(aggregated)))
            }
            StepAction::Rendering { input: source } => {
                let dataset = input.dataset_from(source.as_deref())?;
                let path = services
                    .renderer
                    .render(&input.report, &dataset, &input.run)
                    .with_context(|| format!("failed to render report '{}'", input.report.report_id))?;
                Ok(StepOutput::Artifact(path))
            }
            StepAction::Custom { name, handler, options } => {
                handler.run(input, options).with_context(|| format!("custom step handler '{name}' failed"))
            }
        }
    }
}

fn decode_config<T>(step: &WorkflowStep) -> Result<T, ConfigurationError>
where
    T: DeserializeOwned,
{
    let config = match &step.config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|error| ConfigurationError::invalid_step_config(&step.id, error.to_string()))
}

fn check_input(step: &WorkflowStep, input: Option<&str>) -> Result<(), ConfigurationError> {
    match input {
        Some(input) if !step.depends_on.iter().any(|dependency| dependency == input) => Err(
            ConfigurationError::invalid_step_config(&step.id, format!("input '{input}' is not a declared dependency")),
        ),
        None if step.depends_on.is_empty() => Err(ConfigurationError::invalid_step_config(
            &step.id,
            format!("{} steps need a dependency that provides their dataset", step.kind.as_str()),
        )),
        _ => Ok(()),
    }
}

//! Workflow orchestration.
//!
//! A run goes through two phases. Planning loads the workflow and its report, levels the step
//! graph, compiles rules, and decodes every step; any configuration error surfaces here and no
//! step starts. Execution then walks the levels: each level's steps run concurrently on a bounded
//! worker pool, and the next level starts only after the whole level has finished. After the first
//! failure the current level drains and no further level starts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regflow_types::{
    AdjustableColumnSpec, AggregationRule, ColumnEdit, Dataset, DatasetId, ReportConfig, ValidationRule, WorkflowDefinition,
};
use serde_json::{Map as JsonMap, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::collaborators::{ConfigurationSource, DataExtractor, ReportRenderer};
use super::context::{RunInfo, StepStatus, WorkflowContext};
use super::steps::{StepAction, StepHandler, StepInput, StepOutput, StepServices};
use crate::aggregation::{AggregationPipeline, CustomAggregation};
use crate::error::{AggregationError, ConfigurationError, ReprocessingError, WorkflowError, WorkflowExecutionError};
use crate::graph::DependencyGraph;
use crate::resolver::{DEFAULT_RETAINED_DATASETS, ReportabilityResolver, ValidationResult};
use crate::rules::{Arity, CompiledRuleSet, FunctionRegistry, RuleSetCache};

pub const DEFAULT_POOL_SIZE: usize = 4;

/// A workflow that passed preflight and is ready to execute.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub workflow: Arc<WorkflowDefinition>,
    pub report: Arc<ReportConfig>,
    pub levels: Vec<Vec<String>>,
    pub rules: Arc<CompiledRuleSet>,
    actions: IndexMap<String, Arc<StepAction>>,
}

impl ExecutionPlan {
    pub fn action(&self, step_id: &str) -> Option<&Arc<StepAction>> {
        self.actions.get(step_id)
    }

    pub fn step_count(&self) -> usize {
        self.actions.len()
    }
}

struct StepCompletion {
    step_id: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
    result: anyhow::Result<StepOutput>,
}

pub struct WorkflowEngine {
    config: Arc<dyn ConfigurationSource>,
    services: Arc<StepServices>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    rule_cache: RuleSetCache,
    pool: Arc<Semaphore>,
    pool_size: usize,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        handlers.sort_unstable();
        f.debug_struct("WorkflowEngine")
            .field("pool_size", &self.pool_size)
            .field("handlers", &handlers)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

pub struct WorkflowEngineBuilder {
    config: Arc<dyn ConfigurationSource>,
    extractor: Arc<dyn DataExtractor>,
    renderer: Arc<dyn ReportRenderer>,
    pool_size: usize,
    retained_validations: usize,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    functions: FunctionRegistry,
    aggregation: AggregationPipeline,
}

impl WorkflowEngineBuilder {
    /// Maximum number of steps running at once across all runs of the engine. Clamped to 1.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// How many validated datasets stay available for reprocessing. Clamped to 1.
    pub fn retain_validations(mut self, retained: usize) -> Self {
        self.retained_validations = retained.max(1);
        self
    }

    pub fn register_step_handler(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_custom_aggregation(mut self, name: impl Into<String>, handler: Arc<dyn CustomAggregation>) -> Self {
        self.aggregation.register_custom(name, handler);
        self
    }

    pub fn register_predicate<F>(mut self, name: impl Into<String>, arity: Arity, predicate: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.functions.register_predicate(name, arity, predicate);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let services = StepServices {
            extractor: self.extractor,
            renderer: self.renderer,
            resolver: Arc::new(ReportabilityResolver::new(Arc::new(self.functions)).with_retention(self.retained_validations)),
            aggregation: Arc::new(self.aggregation),
        };
        WorkflowEngine {
            config: self.config,
            services: Arc::new(services),
            handlers: self.handlers,
            rule_cache: RuleSetCache::new(),
            pool: Arc::new(Semaphore::new(self.pool_size)),
            pool_size: self.pool_size,
        }
    }
}

impl WorkflowEngine {
    pub fn builder(
        config: Arc<dyn ConfigurationSource>,
        extractor: Arc<dyn DataExtractor>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config,
            extractor,
            renderer,
            pool_size: DEFAULT_POOL_SIZE,
            retained_validations: DEFAULT_RETAINED_DATASETS,
            handlers: HashMap::new(),
            functions: FunctionRegistry::with_builtins(),
            aggregation: AggregationPipeline::default(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn resolver(&self) -> &ReportabilityResolver {
        &self.services.resolver
    }

    /// Loads and checks a workflow without running anything.
    pub fn plan(&self, workflow_id: &str) -> Result<ExecutionPlan, ConfigurationError> {
        let workflow = self
            .config
            .workflow_definition(workflow_id)
            .map_err(|error| ConfigurationError::WorkflowUnavailable {
                workflow_id: workflow_id.to_string(),
                reason: format!("{error:#}"),
            })?;
        let report = self.report_config(&workflow.report_id)?;

        let graph = DependencyGraph::from_workflow(&workflow)?;
        let levels = graph.compute_levels()?;

        let rules = self.compiled_rules(&report)?;
        self.services.aggregation.check_rules(&report.aggregation_rules)?;

        let mut actions = IndexMap::with_capacity(workflow.steps.len());
        for step in &workflow.steps {
            let action = StepAction::decode(step, &report, &rules, &self.handlers)?;
            actions.insert(step.id.clone(), Arc::new(action));
        }

        debug!(
            workflow = %workflow.workflow_id,
            report = %report.report_id,
            level_count = levels.len(),
            step_count = actions.len(),
            "workflow plan prepared"
        );

        Ok(ExecutionPlan {
            workflow,
            report,
            levels,
            rules,
            actions,
        })
    }

    /// Plans and runs a workflow.
    pub async fn execute_workflow(&self, workflow_id: &str, parameters: JsonMap<String, Value>) -> Result<WorkflowContext, WorkflowError> {
        let plan = self.plan(workflow_id)?;
        Ok(self.execute_plan(&plan, parameters).await?)
    }

    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        parameters: JsonMap<String, Value>,
    ) -> Result<WorkflowContext, WorkflowExecutionError> {
        let run = Arc::new(RunInfo {
            run_id: Uuid::new_v4().to_string(),
            workflow_id: plan.workflow.workflow_id.clone(),
            report_id: plan.report.report_id.clone(),
            parameters,
        });
        let mut context = WorkflowContext::new(&run, &plan.workflow, &plan.levels);
        context.start(Utc::now());

        info!(
            run_id = %run.run_id,
            workflow = %run.workflow_id,
            report = %run.report_id,
            level_count = plan.levels.len(),
            step_count = plan.step_count(),
            pool_size = self.pool_size,
            "workflow execution started"
        );

        let mut failure: Option<(String, anyhow::Error)> = None;
        for (level, step_ids) in plan.levels.iter().enumerate() {
            info!(run_id = %run.run_id, level, step_count = step_ids.len(), "workflow level started");
            self.run_level(plan, &run, step_ids, &mut context, &mut failure).await;
            if failure.is_some() {
                break;
            }
        }

        context.finish(Utc::now());
        let summary = (
            context.count_with_status(StepStatus::Succeeded),
            context.count_with_status(StepStatus::Failed),
            context.count_with_status(StepStatus::Pending),
        );

        match failure {
            None => {
                info!(
                    run_id = %run.run_id,
                    workflow = %run.workflow_id,
                    succeeded = summary.0,
                    "workflow execution finished"
                );
                Ok(context)
            }
            Some((step_id, source)) => {
                error!(
                    run_id = %run.run_id,
                    workflow = %run.workflow_id,
                    step_id = %step_id,
                    succeeded = summary.0,
                    failed = summary.1,
                    not_started = summary.2,
                    error = %format!("{source:#}"),
                    "workflow execution failed"
                );
                Err(WorkflowExecutionError {
                    run_id: run.run_id.clone(),
                    step_id,
                    source,
                    context: Box::new(context),
                })
            }
        }
    }

    async fn run_level(
        &self,
        plan: &ExecutionPlan,
        run: &Arc<RunInfo>,
        step_ids: &[String],
        context: &mut WorkflowContext,
        failure: &mut Option<(String, anyhow::Error)>,
    ) {
        let mut tasks = JoinSet::new();
        let mut outstanding: HashSet<String> = HashSet::with_capacity(step_ids.len());

        for step_id in step_ids {
            let (Some(action), Some(step)) = (plan.action(step_id), plan.workflow.step(step_id)) else {
                continue;
            };
            let input = StepInput {
                run: run.clone(),
                step_id: step_id.clone(),
                report: plan.report.clone(),
                dependencies: context.dependency_outputs(&step.depends_on),
            };
            let action = action.clone();
            let services = self.services.clone();
            let pool = self.pool.clone();
            let task_step_id = step_id.clone();

            context.mark_running(step_id);
            outstanding.insert(step_id.clone());
            tasks.spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(closed) => {
                        return StepCompletion {
                            step_id: task_step_id,
                            started_at: None,
                            finished_at: Utc::now(),
                            result: Err(anyhow::Error::new(closed).context("worker pool is closed")),
                        };
                    }
                };
                let started_at = Utc::now();
                debug!(run_id = %input.run.run_id, step_id = %task_step_id, "step execution started");
                let result = tokio::task::spawn_blocking(move || action.run(&input, &services))
                    .await
                    .unwrap_or_else(|join_error| Err(panic_error(join_error)));
                StepCompletion {
                    step_id: task_step_id,
                    started_at: Some(started_at),
                    finished_at: Utc::now(),
                    result,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let completion = match joined {
                Ok(completion) => completion,
                Err(join_error) => {
                    warn!(run_id = %run.run_id, error = %join_error, "step task ended abnormally");
                    continue;
                }
            };
            outstanding.remove(&completion.step_id);
            self.record_completion(run, completion, context, failure);
        }

        // Only reachable when a task itself was torn down before reporting back.
        for step_id in outstanding {
            let error = anyhow::anyhow!("step '{step_id}' was aborted before it reported a result");
            context.record_failure(&step_id, None, Utc::now(), format!("{error:#}"));
            if failure.is_none() {
                *failure = Some((step_id, error));
            }
        }
    }

    fn record_completion(
        &self,
        run: &RunInfo,
        completion: StepCompletion,
        context: &mut WorkflowContext,
        failure: &mut Option<(String, anyhow::Error)>,
    ) {
        let StepCompletion {
            step_id,
            started_at,
            finished_at,
            result,
        } = completion;
        let duration_ms = started_at.map(|started| (finished_at - started).num_milliseconds());

        match result {
            Ok(output) => {
                debug!(run_id = %run.run_id, step_id = %step_id, duration_ms, "step execution succeeded");
                context.record_success(&step_id, started_at.unwrap_or(finished_at), finished_at, output);
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!(run_id = %run.run_id, step_id = %step_id, duration_ms, error = %message, "step execution failed");
                context.record_failure(&step_id, started_at, finished_at, message);
                if failure.is_none() {
                    *failure = Some((step_id, error));
                }
            }
        }
    }

    /// Validates a dataset with ad hoc rules.
    pub fn validate(
        &self,
        dataset: &Dataset,
        rules: &[ValidationRule],
        adjustable: &AdjustableColumnSpec,
    ) -> Result<ValidationResult, ConfigurationError> {
        self.services.resolver.validate(dataset, rules, adjustable)
    }

    /// Validates a dataset with a configured report's cached rules.
    pub fn validate_report(&self, report_id: &str, dataset: &Dataset) -> Result<ValidationResult, ConfigurationError> {
        let report = self.report_config(report_id)?;
        let rules = self.compiled_rules(&report)?;
        Ok(self
            .services
            .resolver
            .validate_compiled(dataset, rules, &report.adjustable_columns))
    }

    pub fn aggregate(&self, dataset: &Dataset, rules: &[AggregationRule]) -> Result<Dataset, AggregationError> {
        self.services.aggregation.aggregate(dataset, rules)
    }

    pub fn reprocess_adjustment(&self, dataset_id: &DatasetId, edits: &[ColumnEdit]) -> Result<ValidationResult, ReprocessingError> {
        self.services.resolver.reprocess_adjustment(dataset_id, edits)
    }

    /// Forgets the validations a finished run left for reprocessing. Returns how many were dropped.
    pub fn release_run(&self, run_id: &str) -> usize {
        let released = self.services.resolver.evict_run(run_id);
        debug!(run = %run_id, released, "run released");
        released
    }

    /// Re-reads configuration and recompiles rules on next use.
    pub fn reload_configuration(&self) {
        self.config.reload();
        self.rule_cache.clear();
        info!("configuration reloaded");
    }

    fn report_config(&self, report_id: &str) -> Result<Arc<ReportConfig>, ConfigurationError> {
        self.config
            .report_config(report_id)
            .map_err(|error| ConfigurationError::ReportUnavailable {
                report_id: report_id.to_string(),
                reason: format!("{error:#}"),
            })
    }

    fn compiled_rules(&self, report: &ReportConfig) -> Result<Arc<CompiledRuleSet>, ConfigurationError> {
        self.rule_cache
            .get_or_compile(&report.report_id, &report.validation_rules, self.services.resolver.registry())
    }
}

fn panic_error(join_error: JoinError) -> anyhow::Error {
    if !join_error.is_panic() {
        return anyhow::Error::new(join_error).context("step was cancelled");
    }
    let payload = join_error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("step panicked: {message}")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use regflow_types::{Column, ColumnType, DataSourceDescriptor, Row, Schema, StepKind, WorkflowStep};
    use serde_json::json;

    use super::*;
    use crate::workflow::collaborators::{InMemoryConfigSource, InMemoryExtractor};
    use crate::workflow::context::RunStatus;

    struct PathRenderer;

    impl ReportRenderer for PathRenderer {
        fn render(&self, report: &ReportConfig, dataset: &Dataset, run: &RunInfo) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("{}_{}_{}.json", report.report_id, run.run_id, dataset.len())))
        }
    }

    fn engine(workflow: WorkflowDefinition) -> WorkflowEngine {
        let report = ReportConfig {
            report_id: "emir".into(),
            data_sources: vec![DataSourceDescriptor {
                name: "trades".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let dataset = Dataset::new("trades", Schema::new(vec![Column::new("v", ColumnType::Integer)]))
            .with_rows(vec![Row::new("1").with("v", json!(1))]);
        WorkflowEngine::builder(
            Arc::new(InMemoryConfigSource::new().with_report(report).with_workflow(workflow)),
            Arc::new(InMemoryExtractor::new().with_dataset("trades", dataset)),
            Arc::new(PathRenderer),
        )
        .pool_size(0)
        .register_step_handler(
            "explode",
            Arc::new(|_: &StepInput, _: &Value| -> anyhow::Result<StepOutput> { panic!("boom") }),
        )
        .build()
    }

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: "daily".into(),
            report_id: "emir".into(),
            description: None,
            steps,
        }
    }

    #[test]
    fn pool_size_is_clamped() {
        assert_eq!(engine(workflow(Vec::new())).pool_size(), 1);
    }

    #[tokio::test]
    async fn runs_a_linear_workflow() {
        let engine = engine(workflow(vec![
            WorkflowStep::new("extract", StepKind::Extraction),
            WorkflowStep::new("validate", StepKind::Validation).depends_on(["extract"]),
            WorkflowStep::new("render", StepKind::Rendering).depends_on(["validate"]),
        ]));
        let context = engine.execute_workflow("daily", JsonMap::new()).await.expect("run");
        assert_eq!(context.status, RunStatus::Succeeded);
        assert_eq!(context.count_with_status(StepStatus::Succeeded), 3);
        let (_, artifact) = context.artifacts().next().expect("artifact");
        assert!(artifact.to_string_lossy().ends_with("_1.json"));
        let record = context.step("validate").expect("record");
        assert!(record.started_at.is_some() && record.finished_at >= record.started_at);
    }

    #[tokio::test]
    async fn panicking_step_fails_the_run() {
        let engine = engine(workflow(vec![
            WorkflowStep::new("extract", StepKind::Extraction),
            WorkflowStep::new("explode", StepKind::Custom).with_config(json!({"handler": "explode"})),
            WorkflowStep::new("validate", StepKind::Validation).depends_on(["extract"]),
        ]));
        let error = engine.execute_workflow("daily", JsonMap::new()).await.expect_err("panic");
        let WorkflowError::Execution(error) = error else {
            panic!("expected execution error");
        };
        assert_eq!(error.step_id, "explode");
        assert!(error.to_string().contains("step panicked: boom"), "{error}");
        assert_eq!(error.context.step("extract").map(|record| record.status), Some(StepStatus::Succeeded));
        assert_eq!(error.context.step("validate").map(|record| record.status), Some(StepStatus::Pending));
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_configuration_error() {
        let engine = engine(workflow(Vec::new()));
        let error = engine.execute_workflow("weekly", JsonMap::new()).await.expect_err("missing");
        assert!(matches!(
            error,
            WorkflowError::Configuration(ConfigurationError::WorkflowUnavailable { .. })
        ));
    }
}

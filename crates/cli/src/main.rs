mod cli;
mod summary;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::Parser;
use regflow_engine::{ConfigurationSource, WorkflowEngine, WorkflowError, parse_document_file};
use regflow_types::{ColumnEdit, DataSourceDescriptor};
use regflow_util::{DirectoryConfigSource, EngineSettings, JsonFileExtractor, JsonFileRenderer};
use serde_json::{Map as JsonMap, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, OutputFormat};
use crate::summary::{PlanSummary, RunSummary, ValidationReport, print};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = EngineSettings::from_env()?;
    if let Some(config_dir) = cli.config_dir {
        settings.config_dir = config_dir;
    }
    let config = Arc::new(DirectoryConfigSource::new(&settings.config_dir));
    let engine = WorkflowEngine::builder(
        config.clone(),
        Arc::new(JsonFileExtractor::with_base_dir(&settings.config_dir)),
        Arc::new(JsonFileRenderer::new(&settings.output_dir)),
    )
    .pool_size(settings.worker_pool_size)
    .build();

    match cli.command {
        Commands::Run {
            workflow_id,
            params,
            as_of,
        } => run_workflow(&engine, cli.format, &workflow_id, params, as_of).await,
        Commands::Validate {
            report_id,
            data,
            source,
            edits,
        } => validate_file(&engine, config.as_ref(), cli.format, &report_id, &data, source.as_deref(), edits.as_deref()),
        Commands::Check { workflow_id } => {
            let plan = engine.plan(&workflow_id)?;
            print(cli.format, &PlanSummary::new(&plan))
        }
    }
}

// Logs go to stderr so printed results stay machine readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_workflow(
    engine: &WorkflowEngine,
    format: OutputFormat,
    workflow_id: &str,
    params: Vec<(String, Value)>,
    as_of: Option<NaiveDate>,
) -> Result<()> {
    let mut parameters: JsonMap<String, Value> = params.into_iter().collect();
    if let Some(as_of) = as_of {
        parameters.insert("as_of".into(), Value::String(as_of.format("%Y-%m-%d").to_string()));
    }

    match engine.execute_workflow(workflow_id, parameters).await {
        Ok(context) => {
            engine.release_run(&context.run_id);
            print(format, &RunSummary::new(&context))
        }
        Err(WorkflowError::Execution(error)) => {
            engine.release_run(&error.context.run_id);
            print(format, &RunSummary::new(&error.context))?;
            Err(error.into())
        }
        Err(error) => Err(error.into()),
    }
}

fn validate_file(
    engine: &WorkflowEngine,
    config: &dyn ConfigurationSource,
    format: OutputFormat,
    report_id: &str,
    data: &Path,
    source: Option<&str>,
    edits: Option<&Path>,
) -> Result<()> {
    let report = config.report_config(report_id)?;
    let descriptor = match source {
        Some(name) => report
            .data_source(name)
            .cloned()
            .ok_or_else(|| anyhow!("report '{report_id}' has no data source named '{name}'"))?,
        None => report.data_sources.first().cloned().unwrap_or_else(|| DataSourceDescriptor {
            name: data.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default(),
            ..Default::default()
        }),
    };

    let dataset = JsonFileExtractor::new().read_file(data, &descriptor)?;
    let result = engine.validate_report(report_id, &dataset)?;
    let Some(edits_path) = edits else {
        return print(format, &ValidationReport::new(&result, 0));
    };

    let edits: Vec<ColumnEdit> =
        parse_document_file(edits_path).with_context(|| format!("Failed to load column edits: {}", edits_path.display()))?;
    let adjusted = engine.reprocess_adjustment(&result.dataset_id, &edits)?;
    info!(report = %report_id, edits = edits.len(), "column edits applied");
    print(format, &ValidationReport::new(&adjusted, edits.len()))
}

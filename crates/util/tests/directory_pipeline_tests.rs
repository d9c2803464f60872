use std::fs;
use std::path::Path;
use std::sync::Arc;

use regflow_engine::{RunStatus, StepStatus, WorkflowEngine};
use regflow_util::{DirectoryConfigSource, JsonFileExtractor, JsonFileRenderer};
use serde_json::{Map as JsonMap, Value, json};

const REPORT: &str = r#"
report_id: emir_trades
data_sources:
  - name: trades
    path: "data/trades_${{ parameters.as_of }}.json"
    id_column: trade_id
    schema:
      - { name: trade_id, type: string }
      - { name: desk, type: string }
      - { name: lei, type: string }
      - { name: notional, type: decimal }
validation_rules:
  - id: lei_required
    scope: FIELD
    field: lei
    condition: required(lei)
  - id: notional_is_number
    scope: FIELD
    field: notional
    condition: is_number(notional)
aggregation_rules:
  - id: by_desk
    type: GROUP_BY
    group_by: [desk]
    columns:
      - { input: notional, output: total_notional, function: SUM }
adjustable_columns: [lei]
"#;

const WORKFLOW: &str = r#"
workflow_id: emir_daily
report_id: emir_trades
steps:
  - id: extract
    type: extraction
  - id: validate
    type: validation
    depends_on: [extract]
  - id: aggregate
    type: aggregation
    depends_on: [validate]
  - id: render
    type: rendering
    depends_on: [aggregate]
"#;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

const TRADES: &str = r#"[
    {"trade_id": "T1", "desk": "A", "lei": "L1", "notional": "10"},
    {"trade_id": "T2", "desk": "A", "lei": "L2", "notional": 20},
    {"trade_id": "T3", "desk": "B", "lei": "L3", "notional": "oops"},
    {"trade_id": "T4", "desk": "B", "notional": 7}
]"#;

fn configuration_dir() -> tempfile::TempDir {
    let config_dir = tempfile::tempdir().unwrap();
    write(&config_dir.path().join("reports/emir_trades.yaml"), REPORT);
    write(&config_dir.path().join("workflows/emir_daily.yaml"), WORKFLOW);
    write(&config_dir.path().join("data/trades_2024-06-28.json"), TRADES);
    config_dir
}

fn as_of_parameters() -> JsonMap<String, Value> {
    let mut parameters = JsonMap::new();
    parameters.insert("as_of".into(), json!("2024-06-28"));
    parameters
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_a_workflow_from_a_configuration_directory() {
    let config_dir = configuration_dir();
    let output_dir = tempfile::tempdir().unwrap();

    let engine = WorkflowEngine::builder(
        Arc::new(DirectoryConfigSource::new(config_dir.path())),
        Arc::new(JsonFileExtractor::with_base_dir(config_dir.path())),
        Arc::new(JsonFileRenderer::new(output_dir.path())),
    )
    .pool_size(2)
    .build();

    let context = engine.execute_workflow("emir_daily", as_of_parameters()).await.expect("run succeeds");

    assert_eq!(context.status, RunStatus::Succeeded);
    assert_eq!(context.count_with_status(StepStatus::Succeeded), 4);

    let (_, validation) = context.validation_results().next().expect("validation result");
    assert_eq!(validation.summary.total_rows, 4);
    assert_eq!(validation.summary.valid_rows, 2);
    assert_eq!(validation.summary.invalid_rows, 2);

    let (_, artifact) = context.artifacts().next().expect("artifact");
    assert_eq!(artifact, &output_dir.path().join(format!("emir_trades_{}.json", context.run_id)));
    let written: Value = serde_json::from_str(&fs::read_to_string(artifact).unwrap()).unwrap();
    assert_eq!(written["as_of"], "2024-06-28");
    assert_eq!(written["rows"], json!([{"desk": "A", "total_notional": 30}]));
}

#[tokio::test]
async fn missing_workflow_document_is_a_configuration_error() {
    let config_dir = tempfile::tempdir().unwrap();
    let engine = WorkflowEngine::builder(
        Arc::new(DirectoryConfigSource::new(config_dir.path())),
        Arc::new(JsonFileExtractor::new()),
        Arc::new(JsonFileRenderer::new(config_dir.path())),
    )
    .build();

    let error = engine.execute_workflow("absent", JsonMap::new()).await.expect_err("no workflow");
    assert!(error.to_string().contains("absent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_runs_keep_the_validation_store_bounded() {
    let config_dir = configuration_dir();
    let output_dir = tempfile::tempdir().unwrap();
    let engine = WorkflowEngine::builder(
        Arc::new(DirectoryConfigSource::new(config_dir.path())),
        Arc::new(JsonFileExtractor::with_base_dir(config_dir.path())),
        Arc::new(JsonFileRenderer::new(output_dir.path())),
    )
    .retain_validations(1)
    .build();

    let mut last_run = String::new();
    for _ in 0..5 {
        let context = engine.execute_workflow("emir_daily", as_of_parameters()).await.expect("run succeeds");
        assert!(engine.resolver().stored_datasets() <= 1);
        last_run = context.run_id;
    }
    assert_eq!(engine.resolver().stored_datasets(), 1);

    assert_eq!(engine.release_run(&last_run), 1);
    assert_eq!(engine.resolver().stored_datasets(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_picks_up_edited_report_rules() {
    let config_dir = configuration_dir();
    let output_dir = tempfile::tempdir().unwrap();
    let engine = WorkflowEngine::builder(
        Arc::new(DirectoryConfigSource::new(config_dir.path())),
        Arc::new(JsonFileExtractor::with_base_dir(config_dir.path())),
        Arc::new(JsonFileRenderer::new(output_dir.path())),
    )
    .build();

    let context = engine.execute_workflow("emir_daily", as_of_parameters()).await.expect("run succeeds");
    let (_, validation) = context.validation_results().next().expect("validation result");
    assert_eq!(validation.summary.invalid_rows, 2);
    engine.release_run(&context.run_id);

    let relaxed = REPORT.replace("  - id: lei_required\n    scope: FIELD\n    field: lei\n    condition: required(lei)\n", "");
    assert_ne!(relaxed, REPORT);
    write(&config_dir.path().join("reports/emir_trades.yaml"), &relaxed);

    // Documents are cached until the engine reloads.
    let context = engine.execute_workflow("emir_daily", as_of_parameters()).await.expect("run succeeds");
    let (_, validation) = context.validation_results().next().expect("validation result");
    assert_eq!(validation.summary.invalid_rows, 2);

    engine.reload_configuration();
    let context = engine.execute_workflow("emir_daily", as_of_parameters()).await.expect("run succeeds");
    let (_, validation) = context.validation_results().next().expect("validation result");
    assert_eq!(validation.summary.valid_rows, 3);
    assert_eq!(validation.summary.invalid_rows, 1);
}

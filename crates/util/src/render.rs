//! JSON artifact rendering.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use regflow_engine::{ReportRenderer, RunInfo};
use regflow_types::{Dataset, ReportConfig, Schema};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub const JSON_FORMAT: &str = "json";

#[derive(Serialize)]
struct RenderedReport<'a> {
    report_id: &'a str,
    run_id: &'a str,
    as_of: Option<&'a str>,
    columns: &'a Schema,
    rows: Vec<IndexMap<&'a str, &'a Value>>,
}

/// Writes `<output_dir>/<report_id>_<run_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileRenderer {
    output_dir: PathBuf,
}

impl JsonFileRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn artifact_path(&self, report_id: &str, run_id: &str) -> PathBuf {
        self.output_dir.join(format!("{report_id}_{run_id}.json"))
    }
}

impl ReportRenderer for JsonFileRenderer {
    fn render(&self, report: &ReportConfig, dataset: &Dataset, run: &RunInfo) -> Result<PathBuf> {
        if let Some(format) = report.output_format.as_deref()
            && !format.eq_ignore_ascii_case(JSON_FORMAT)
        {
            bail!("report '{}' asks for '{format}' output, only json is supported", report.report_id);
        }

        let rows = dataset
            .rows
            .iter()
            .map(|row| dataset.schema.names().map(|column| (column, row.get(column))).collect())
            .collect();
        let rendered = RenderedReport {
            report_id: &report.report_id,
            run_id: &run.run_id,
            as_of: run.as_of(),
            columns: &dataset.schema,
            rows,
        };

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create output directory: {}", self.output_dir.display()))?;
        let path = self.artifact_path(&report.report_id, &run.run_id);
        let content = serde_json::to_string_pretty(&rendered)?;
        fs::write(&path, content).with_context(|| format!("Failed to write artifact: {}", path.display()))?;

        info!(report = %report.report_id, run_id = %run.run_id, rows = dataset.len(), path = %path.display(), "report rendered");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regflow_types::{Column, ColumnType, Row};
    use serde_json::{Map as JsonMap, json};

    fn run() -> RunInfo {
        let mut parameters = JsonMap::new();
        parameters.insert("as_of".into(), json!("2024-06-28"));
        RunInfo {
            run_id: "run-1".into(),
            workflow_id: "daily".into(),
            report_id: "emir".into(),
            parameters,
        }
    }

    fn totals() -> Dataset {
        Dataset::new(
            "emir.by_desk",
            Schema::new(vec![Column::new("desk", ColumnType::String), Column::new("total", ColumnType::Decimal)]),
        )
        .with_rows(vec![
            Row::new("by_desk#1").with("total", json!(30)).with("desk", json!("A")),
            Row::new("by_desk#2").with("desk", json!("B")),
        ])
    }

    #[test]
    fn writes_rows_in_schema_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let renderer = JsonFileRenderer::new(temp_dir.path().join("out"));
        let report = ReportConfig {
            report_id: "emir".into(),
            ..Default::default()
        };

        let path = renderer.render(&report, &totals(), &run()).expect("render");
        assert_eq!(path, temp_dir.path().join("out").join("emir_run-1.json"));

        let content = fs::read_to_string(&path).unwrap();
        let written: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(written["report_id"], "emir");
        assert_eq!(written["as_of"], "2024-06-28");
        assert_eq!(written["columns"][1]["name"], "total");
        assert_eq!(written["rows"][0], json!({"desk": "A", "total": 30}));
        assert_eq!(written["rows"][1], json!({"desk": "B", "total": null}));
        assert!(content.find("\"desk\"").unwrap() < content.find("\"total\"").unwrap());
    }

    #[test]
    fn rejects_other_output_formats() {
        let temp_dir = tempfile::tempdir().unwrap();
        let renderer = JsonFileRenderer::new(temp_dir.path());
        let report = ReportConfig {
            report_id: "emir".into(),
            output_format: Some("xlsx".into()),
            ..Default::default()
        };
        let error = renderer.render(&report, &totals(), &run()).expect_err("xlsx");
        assert!(error.to_string().contains("'xlsx'"));
    }
}

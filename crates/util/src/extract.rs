//! Extraction from JSON row files.
//!
//! A data source's `path` names a file holding a JSON array of objects. The path may reference
//! run parameters with `${{ parameters.<name> }}`, which is how a daily workflow points at the
//! file for its reporting date. Relative paths resolve against the extractor's base directory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use regflow_engine::DataExtractor;
use regflow_engine::templates::interpolate;
use regflow_engine::values::{display_value, number_value};
use regflow_types::{Column, ColumnType, DataSourceDescriptor, Dataset, Row, Schema};
use serde_json::{Map as JsonMap, Value};
use tracing::debug;

const PARAMETER_PREFIX: &str = "parameters.";

#[derive(Debug, Clone, Default)]
pub struct JsonFileExtractor {
    base_dir: Option<PathBuf>,
}

impl JsonFileExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    /// Interpolates run parameters into a path template and anchors it to the base directory.
    pub fn resolve_path(&self, template: &str, parameters: &JsonMap<String, Value>) -> PathBuf {
        let rendered = interpolate(template, |expression| {
            expression
                .strip_prefix(PARAMETER_PREFIX)
                .and_then(|name| parameters.get(name.trim()))
                .map(display_value)
        });
        let path = PathBuf::from(rendered);
        match &self.base_dir {
            Some(base_dir) if path.is_relative() => base_dir.join(path),
            _ => path,
        }
    }

    /// Reads a row file directly, without a data source descriptor's path template.
    pub fn read_file(&self, path: &Path, source: &DataSourceDescriptor) -> Result<Dataset> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read data file: {}", path.display()))?;
        let records: Vec<JsonMap<String, Value>> =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse data file: {}", path.display()))?;
        let dataset = build_dataset(source, records)?;
        debug!(source = %source.name, path = %path.display(), rows = dataset.len(), "data file extracted");
        Ok(dataset)
    }
}

impl DataExtractor for JsonFileExtractor {
    fn extract(&self, source: &DataSourceDescriptor, parameters: &JsonMap<String, Value>) -> Result<Dataset> {
        let template = source
            .path
            .as_deref()
            .ok_or_else(|| anyhow!("data source '{}' has no path", source.name))?;
        let path = self.resolve_path(template, parameters);
        self.read_file(&path, source)
    }
}

fn build_dataset(source: &DataSourceDescriptor, records: Vec<JsonMap<String, Value>>) -> Result<Dataset> {
    let schema = if source.schema.is_empty() {
        inferred_schema(&records)
    } else {
        source.schema.clone()
    };

    let mut seen = HashSet::with_capacity(records.len());
    let mut rows = Vec::with_capacity(records.len());
    for (index, mut record) in records.into_iter().enumerate() {
        let row_id = match &source.id_column {
            Some(id_column) => {
                let value = record.get(id_column).map(display_value).unwrap_or_default();
                if value.is_empty() {
                    bail!("record {} of '{}' has no value in id column '{id_column}'", index + 1, source.name);
                }
                value
            }
            None => (index + 1).to_string(),
        };
        if !seen.insert(row_id.clone()) {
            bail!("duplicate row id '{row_id}' in data source '{}'", source.name);
        }

        let mut row = Row::new(row_id);
        for column in schema.columns() {
            let raw = record.remove(&column.name).unwrap_or(Value::Null);
            row.set(column.name.clone(), coerce(column.r#type, raw));
        }
        rows.push(row);
    }

    Ok(Dataset::new(source.name.clone(), schema).with_rows(rows))
}

/// Untyped files get string columns, added record by record as new keys show up. Keys inside one
/// record come out sorted by name because JSON objects are read into a sorted map, so the file's
/// own key order is not kept. Cells are kept as read.
fn inferred_schema(records: &[JsonMap<String, Value>]) -> Schema {
    let mut schema = Schema::default();
    for record in records {
        for key in record.keys() {
            if !schema.contains(key) {
                schema.push(Column::new(key.clone(), ColumnType::String));
            }
        }
    }
    schema
}

/// Converts a cell to its declared type. Cells that do not convert are kept as they were read so
/// validation rules can flag them.
fn coerce(column_type: ColumnType, value: Value) -> Value {
    let text = match value.as_str() {
        Some(text) => text.trim(),
        None => return coerce_non_string(column_type, value),
    };
    if text.is_empty() && column_type != ColumnType::String {
        return Value::Null;
    }
    match column_type {
        ColumnType::String | ColumnType::Date => value,
        ColumnType::Integer => text.parse::<i64>().map(Value::from).unwrap_or(value),
        ColumnType::Decimal => text
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .map(number_value)
            .unwrap_or(value),
        ColumnType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value,
        },
    }
}

fn coerce_non_string(column_type: ColumnType, value: Value) -> Value {
    match (column_type, &value) {
        (ColumnType::String, Value::Number(_) | Value::Bool(_)) => Value::String(value.to_string()),
        _ => value,
    }
}

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

/// Configuration-driven regulatory reporting pipelines.
#[derive(Parser, Debug)]
#[command(name = "regflow", version, about)]
pub struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json, help = "Format of the printed result")]
    pub format: OutputFormat,
    #[arg(long, global = true, value_name = "DIR", help = "Configuration directory, overrides REGFLOW_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a workflow end to end and print the run summary
    Run {
        workflow_id: String,
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_parameter)]
        params: Vec<(String, Value)>,
        #[arg(long, value_name = "DATE", value_parser = parse_as_of)]
        as_of: Option<NaiveDate>,
    },
    /// Validate a JSON row file against a report's rules
    Validate {
        report_id: String,
        #[arg(long, value_name = "FILE")]
        data: PathBuf,
        /// Data source whose schema describes the file; defaults to the report's first source
        #[arg(long)]
        source: Option<String>,
        /// Column edits to apply and re-validate after the first pass
        #[arg(long, value_name = "FILE")]
        edits: Option<PathBuf>,
    },
    /// Check a workflow's configuration and print its execution levels
    Check { workflow_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Parses `key=value`. Values that read as JSON keep their type; anything else is a string.
pub fn parse_parameter(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter name missing in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_as_of(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| format!("expected YYYY-MM-DD: {error}"))
}

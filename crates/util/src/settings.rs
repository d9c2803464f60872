//! Engine settings resolved from the environment.
//!
//! Every setting has a default so a bare `regflow` invocation works out of the box. Overrides
//! come from `REGFLOW_*` variables; paths accept a leading `~`.

use std::env;
use std::path::PathBuf;

use dirs_next::{config_dir, home_dir};
use regflow_engine::workflow::DEFAULT_POOL_SIZE;
use thiserror::Error;

/// Directory holding `reports/` and `workflows/` documents.
pub const CONFIG_DIR_ENV: &str = "REGFLOW_CONFIG_DIR";

/// Directory rendered artifacts are written to.
pub const OUTPUT_DIR_ENV: &str = "REGFLOW_OUTPUT_DIR";

/// Number of steps allowed to run at the same time.
pub const WORKER_POOL_SIZE_ENV: &str = "REGFLOW_WORKER_POOL_SIZE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{variable} must be a positive integer, got '{value}'")]
    InvalidPoolSize { variable: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
    pub worker_pool_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            output_dir: PathBuf::from("output"),
            worker_pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl EngineSettings {
    /// Reads overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        if let Some(path) = env_value(CONFIG_DIR_ENV) {
            settings.config_dir = expand_tilde(&path);
        }
        if let Some(path) = env_value(OUTPUT_DIR_ENV) {
            settings.output_dir = expand_tilde(&path);
        }
        if let Some(raw) = env_value(WORKER_POOL_SIZE_ENV) {
            settings.worker_pool_size = parse_pool_size(&raw)?;
        }
        Ok(settings)
    }
}

fn default_config_dir() -> PathBuf {
    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("regflow")
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_pool_size(raw: &str) -> Result<usize, SettingsError> {
    match raw.trim().parse::<usize>() {
        Ok(size) if size >= 1 => Ok(size),
        _ => Err(SettingsError::InvalidPoolSize {
            variable: WORKER_POOL_SIZE_ENV,
            value: raw.to_string(),
        }),
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(trimmed)
}

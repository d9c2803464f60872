//! Report and workflow documents read from a configuration directory.
//!
//! Layout:
//!
//! ```text
//! <root>/reports/<report_id>.yaml
//! <root>/workflows/<workflow_id>.yaml
//! ```
//!
//! `.yml` and `.json` are accepted as well. Documents are parsed once and then served from a
//! per-kind cache until the source is cleared or reloaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use regflow_engine::{ConfigurationSource, parse_document_file};
use regflow_types::{ReportConfig, WorkflowDefinition};
use serde::de::DeserializeOwned;
use tracing::debug;

pub const REPORTS_FOLDER: &str = "reports";
pub const WORKFLOWS_FOLDER: &str = "workflows";

const DOCUMENT_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

trait ConfigDocument: DeserializeOwned {
    const FOLDER: &'static str;

    fn document_id(&self) -> &str;
}

impl ConfigDocument for ReportConfig {
    const FOLDER: &'static str = REPORTS_FOLDER;

    fn document_id(&self) -> &str {
        &self.report_id
    }
}

impl ConfigDocument for WorkflowDefinition {
    const FOLDER: &'static str = WORKFLOWS_FOLDER;

    fn document_id(&self) -> &str {
        &self.workflow_id
    }
}

#[derive(Debug)]
pub struct DirectoryConfigSource {
    root: PathBuf,
    reports: Mutex<HashMap<String, Arc<ReportConfig>>>,
    workflows: Mutex<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl DirectoryConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reports: Mutex::new(HashMap::new()),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Forgets every cached document so edits on disk are picked up.
    pub fn clear(&self) {
        self.reports.lock().expect("report cache lock poisoned").clear();
        self.workflows.lock().expect("workflow cache lock poisoned").clear();
    }

    /// Finds the document file for an id, trying each accepted extension in turn.
    pub fn locate(&self, folder: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            bail!("invalid document id '{id}'");
        }
        let directory = self.root.join(folder);
        DOCUMENT_EXTENSIONS
            .iter()
            .map(|extension| directory.join(format!("{id}.{extension}")))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| anyhow::anyhow!("no document for '{id}' in {}", directory.display()))
    }

    fn load<T: ConfigDocument>(&self, cache: &Mutex<HashMap<String, Arc<T>>>, id: &str) -> Result<Arc<T>> {
        if let Some(document) = cache.lock().expect("config cache lock poisoned").get(id) {
            return Ok(Arc::clone(document));
        }

        let path = self.locate(T::FOLDER, id)?;
        let document: T = parse_document_file(&path)?;
        if document.document_id() != id {
            bail!(
                "{} declares id '{}' but was requested as '{id}'",
                path.display(),
                document.document_id()
            );
        }
        debug!(path = %path.display(), id, "configuration document loaded");

        let mut cache = cache.lock().expect("config cache lock poisoned");
        Ok(Arc::clone(cache.entry(id.to_string()).or_insert_with(|| Arc::new(document))))
    }
}

impl ConfigurationSource for DirectoryConfigSource {
    fn report_config(&self, report_id: &str) -> Result<Arc<ReportConfig>> {
        self.load(&self.reports, report_id)
    }

    fn workflow_definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.load(&self.workflows, workflow_id)
    }

    fn reload(&self) {
        self.clear();
    }
}

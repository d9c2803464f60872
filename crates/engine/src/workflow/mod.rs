//! Workflow orchestration.
//!
//! `orchestrator` plans and executes runs, `steps` defines what a step is and how the built-in
//! types behave, `context` holds the run state the orchestrator owns, and `collaborators` declares
//! the extraction, configuration, and rendering seams.

pub mod collaborators;
pub mod context;
pub mod orchestrator;
pub mod steps;

pub use collaborators::{ConfigurationSource, DataExtractor, InMemoryConfigSource, InMemoryExtractor, ReportRenderer};
pub use context::{RunInfo, RunStatus, StepFailure, StepRecord, StepStatus, WorkflowContext};
pub use orchestrator::{DEFAULT_POOL_SIZE, ExecutionPlan, WorkflowEngine, WorkflowEngineBuilder};
pub use steps::{StepAction, StepHandler, StepInput, StepOutput, StepServices};

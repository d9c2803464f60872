//! Shared data model for the regflow reporting pipeline.
//!
//! Everything here is plain, serde-friendly configuration or data. Behaviour lives in
//! `regflow-engine`; the file-backed collaborators in `regflow-util` only move these types in and
//! out of storage.

pub mod aggregation;
pub mod dataset;
pub mod rules;
pub mod workflow;

pub use aggregation::{AggregationColumn, AggregationKind, AggregationRule};
pub use dataset::{Column, ColumnType, Dataset, DatasetId, Row, RowId, Schema};
pub use rules::{AdjustableColumnSpec, ColumnEdit, RuleFailure, RuleScope, Severity, ValidationOutcome, ValidationRule, ValidationSummary};
pub use workflow::{DataSourceDescriptor, ReportConfig, StepKind, WorkflowDefinition, WorkflowStep};

//! Reportability resolution and manual adjustment reprocessing.
//!
//! The resolver turns rule outcomes into a validated dataset (rows without blocking failures) and
//! a summary. It remembers the latest validation of recent datasets so operators can correct
//! adjustable columns and get a fresh result without re-running the workflow. The store keeps at
//! most `retention` datasets; the least recently validated one is dropped first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use regflow_types::{
    AdjustableColumnSpec, ColumnEdit, Dataset, DatasetId, RowId, RuleScope, ValidationRule, ValidationSummary,
};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ConfigurationError, ReprocessingError};
use crate::rules::{Annotation, CompiledRuleSet, EvaluationTarget, FunctionRegistry, RuleOutcomes, annotate, assemble};
use crate::values::display_value;

const VALIDATED_STAGE: &str = "validated";
pub const DEFAULT_RETAINED_DATASETS: usize = 32;

/// Validated rows plus the summary describing how they were selected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Identifier of the dataset that was validated; used for reprocessing.
    pub dataset_id: DatasetId,
    pub validated: Arc<Dataset>,
    pub summary: ValidationSummary,
}

#[derive(Debug)]
struct ValidationRecord {
    source: Dataset,
    rules: Arc<CompiledRuleSet>,
    adjustable: AdjustableColumnSpec,
    annotations: Vec<Annotation>,
    result: ValidationResult,
}

#[derive(Debug)]
pub struct ReportabilityResolver {
    registry: Arc<FunctionRegistry>,
    store: Mutex<IndexMap<DatasetId, ValidationRecord>>,
    retention: usize,
}

impl Default for ReportabilityResolver {
    fn default() -> Self {
        Self::new(Arc::new(FunctionRegistry::with_builtins()))
    }
}

impl ReportabilityResolver {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            store: Mutex::new(IndexMap::new()),
            retention: DEFAULT_RETAINED_DATASETS,
        }
    }

    /// Caps how many validated datasets stay available for reprocessing. At least one is kept.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Compiles `rules` and validates `dataset` with them.
    pub fn validate(
        &self,
        dataset: &Dataset,
        rules: &[ValidationRule],
        adjustable: &AdjustableColumnSpec,
    ) -> Result<ValidationResult, ConfigurationError> {
        let compiled = Arc::new(CompiledRuleSet::compile(rules, &self.registry)?);
        Ok(self.validate_compiled(dataset, compiled, adjustable))
    }

    /// Validates with an already compiled rule set and stores the result for reprocessing,
    /// replacing any earlier validation of the same dataset id.
    pub fn validate_compiled(
        &self,
        dataset: &Dataset,
        rules: Arc<CompiledRuleSet>,
        adjustable: &AdjustableColumnSpec,
    ) -> ValidationResult {
        let annotations = annotate(dataset, &rules, EvaluationTarget::Everything);
        let result = build_result(dataset, assemble(dataset, annotations.clone()));
        debug!(
            dataset = %dataset.id,
            total = result.summary.total_rows,
            valid = result.summary.valid_rows,
            invalid = result.summary.invalid_rows,
            warnings = result.summary.warnings.failing_row_count(),
            "dataset validated"
        );

        let record = ValidationRecord {
            source: dataset.clone(),
            rules,
            adjustable: adjustable.clone(),
            annotations,
            result: result.clone(),
        };
        let mut store = self.store.lock().expect("validation store lock poisoned");
        store.shift_remove(&dataset.id);
        store.insert(dataset.id.clone(), record);
        while store.len() > self.retention {
            if let Some((evicted, _)) = store.shift_remove_index(0) {
                debug!(dataset = %evicted, "validation evicted");
            }
        }
        result
    }

    /// Applies manual edits to a previously validated dataset and re-evaluates the affected rules.
    ///
    /// Every edit is checked before any is applied; a rejected request leaves the stored state
    /// exactly as it was.
    pub fn reprocess_adjustment(
        &self,
        dataset_id: &DatasetId,
        edits: &[ColumnEdit],
    ) -> Result<ValidationResult, ReprocessingError> {
        let mut store = self.store.lock().expect("validation store lock poisoned");
        let Some(record) = store.get_mut(dataset_id) else {
            return Err(ReprocessingError::UnknownDataset {
                dataset_id: dataset_id.to_string(),
            });
        };

        if let Some(edit) = edits.iter().find(|edit| !record.adjustable.is_adjustable(&edit.column)) {
            return Err(ReprocessingError::NonAdjustableColumn {
                dataset_id: dataset_id.to_string(),
                row_id: edit.row_id.to_string(),
                column: edit.column.clone(),
            });
        }
        if let Some(edit) = edits.iter().find(|edit| !record.source.has_column(&edit.column)) {
            return Err(ReprocessingError::UnknownColumn {
                dataset_id: dataset_id.to_string(),
                column: edit.column.clone(),
            });
        }
        if let Some(edit) = edits.iter().find(|edit| record.source.row(&edit.row_id).is_none()) {
            return Err(ReprocessingError::UnknownRow {
                dataset_id: dataset_id.to_string(),
                row_id: edit.row_id.to_string(),
            });
        }

        let mut source = record.source.clone();
        let mut edited: HashSet<RowId> = HashSet::new();
        for edit in edits {
            let Some(position) = source.row_position(&edit.row_id) else {
                continue;
            };
            let row = &mut source.rows[position];
            let previous = display_value(row.get(&edit.column));
            row.set(edit.column.clone(), edit.value.clone());
            edited.insert(edit.row_id.clone());
            info!(
                target: "regflow::audit",
                dataset = %dataset_id,
                row = %edit.row_id,
                column = %edit.column,
                previous = %previous,
                value = %display_value(&edit.value),
                "manual adjustment applied"
            );
        }

        let mut annotations: Vec<Annotation> = record
            .annotations
            .iter()
            .filter(|annotation| annotation.scope != RuleScope::CrossRow && !edited.contains(&annotation.row_id))
            .cloned()
            .collect();
        annotations.extend(annotate(&source, &record.rules, EvaluationTarget::RowRules(&edited)));
        annotations.extend(annotate(&source, &record.rules, EvaluationTarget::CrossRowRules));

        let result = build_result(&source, assemble(&source, annotations.clone()));
        info!(
            target: "regflow::audit",
            dataset = %dataset_id,
            edits = edits.len(),
            rows = edited.len(),
            valid = result.summary.valid_rows,
            invalid = result.summary.invalid_rows,
            "adjustment reprocessed"
        );

        record.source = source;
        record.annotations = annotations;
        record.result = result.clone();
        Ok(result)
    }

    /// Latest result for a dataset, if it has been validated and not evicted.
    pub fn validated(&self, dataset_id: &DatasetId) -> Option<ValidationResult> {
        self.store
            .lock()
            .expect("validation store lock poisoned")
            .get(dataset_id)
            .map(|record| record.result.clone())
    }

    /// Forgets a dataset. Returns whether anything was stored.
    pub fn evict(&self, dataset_id: &DatasetId) -> bool {
        self.store.lock().expect("validation store lock poisoned").shift_remove(dataset_id).is_some()
    }

    /// Forgets every dataset produced by a workflow run. Returns how many were stored.
    pub fn evict_run(&self, run_id: &str) -> usize {
        let prefix = format!("{run_id}/");
        let mut store = self.store.lock().expect("validation store lock poisoned");
        let before = store.len();
        store.retain(|dataset_id, _| !dataset_id.as_str().starts_with(&prefix));
        before - store.len()
    }

    pub fn stored_datasets(&self) -> usize {
        self.store.lock().expect("validation store lock poisoned").len()
    }
}

fn build_result(source: &Dataset, outcomes: RuleOutcomes) -> ValidationResult {
    let rows = source
        .rows
        .iter()
        .filter(|row| outcomes.errors.is_reportable(&row.id))
        .cloned()
        .collect();
    let validated = source.derive(VALIDATED_STAGE, rows);

    let summary = ValidationSummary {
        total_rows: source.len(),
        valid_rows: validated.len(),
        invalid_rows: outcomes.errors.failing_row_count(),
        outcome: outcomes.errors,
        warnings: outcomes.warnings,
    };

    ValidationResult {
        dataset_id: source.id.clone(),
        validated: Arc::new(validated),
        summary,
    }
}

#[cfg(test)]
mod tests {
    use regflow_types::{Column, ColumnType, Row, Schema, Severity};
    use serde_json::json;

    use super::*;

    fn rule(id: &str, scope: RuleScope, field: Option<&str>, condition: &str) -> ValidationRule {
        ValidationRule {
            id: id.into(),
            scope,
            field: field.map(str::to_string),
            condition: condition.into(),
            when: None,
            message: None,
            severity: Severity::Error,
            description: None,
        }
    }

    fn trades() -> Dataset {
        let schema = Schema::new(vec![
            Column::new("trade_id", ColumnType::String),
            Column::new("lei", ColumnType::String),
            Column::new("notional", ColumnType::Decimal),
        ]);
        Dataset::new("run/extract", schema).with_rows(vec![
            Row::new("1").with("trade_id", json!("T1")).with("lei", json!("L1")).with("notional", json!(10)),
            Row::new("2").with("trade_id", json!("T2")).with("lei", json!(null)).with("notional", json!(20)),
            Row::new("3").with("trade_id", json!("T3")).with("lei", json!("L3")).with("notional", json!(30)),
        ])
    }

    fn rules() -> Vec<ValidationRule> {
        vec![
            rule("lei_required", RuleScope::Field, Some("lei"), "required(lei)"),
            rule("unique_id", RuleScope::CrossRow, None, "unique(trade_id)"),
        ]
    }

    #[test]
    fn validated_dataset_holds_only_reportable_rows() {
        let resolver = ReportabilityResolver::default();
        let result = resolver
            .validate(&trades(), &rules(), &AdjustableColumnSpec::new(["lei"]))
            .expect("validate");

        assert_eq!(result.summary.total_rows, 3);
        assert_eq!(result.summary.valid_rows, 2);
        assert_eq!(result.summary.invalid_rows, 1);
        assert_eq!(result.validated.len(), 2);
        assert_eq!(result.validated.id.as_str(), "run/extract.validated");
        for row in &trades().rows {
            let kept = result.validated.row(&row.id).is_some();
            assert_eq!(kept, result.summary.outcome.is_reportable(&row.id));
        }
    }

    #[test]
    fn adjustment_fixes_a_row() {
        let resolver = ReportabilityResolver::default();
        let data = trades();
        resolver
            .validate(&data, &rules(), &AdjustableColumnSpec::new(["lei", "trade_id"]))
            .expect("validate");

        let result = resolver
            .reprocess_adjustment(&data.id, &[ColumnEdit::new("2", "lei", json!("L2"))])
            .expect("reprocess");
        assert_eq!(result.summary.valid_rows, 3);
        assert!(result.summary.outcome.is_empty());

        // A cross-row failure introduced by an edit reaches rows that were not edited.
        let result = resolver
            .reprocess_adjustment(&data.id, &[ColumnEdit::new("3", "trade_id", json!("T1"))])
            .expect("reprocess");
        assert_eq!(result.summary.invalid_rows, 2);
        assert!(!result.summary.outcome.is_reportable(&"1".into()));
        assert_eq!(resolver.validated(&data.id), Some(result));
    }

    #[test]
    fn rejected_adjustments_preserve_state() {
        let resolver = ReportabilityResolver::default();
        let data = trades();
        let before = resolver
            .validate(&data, &rules(), &AdjustableColumnSpec::new(["lei"]))
            .expect("validate");

        let error = resolver
            .reprocess_adjustment(
                &data.id,
                &[
                    ColumnEdit::new("2", "lei", json!("L2")),
                    ColumnEdit::new("2", "notional", json!(1)),
                ],
            )
            .expect_err("non adjustable");
        assert!(matches!(error, ReprocessingError::NonAdjustableColumn { ref column, .. } if column == "notional"));
        assert_eq!(resolver.validated(&data.id), Some(before.clone()));

        let error = resolver
            .reprocess_adjustment(&data.id, &[ColumnEdit::new("9", "lei", json!("L9"))])
            .expect_err("unknown row");
        assert!(matches!(error, ReprocessingError::UnknownRow { .. }));

        let error = resolver
            .reprocess_adjustment(&"other".into(), &[ColumnEdit::new("1", "lei", json!("L"))])
            .expect_err("unknown dataset");
        assert!(matches!(error, ReprocessingError::UnknownDataset { .. }));
        assert_eq!(resolver.validated(&data.id), Some(before));
    }

    #[test]
    fn evict_forgets_the_dataset() {
        let resolver = ReportabilityResolver::default();
        let data = trades();
        resolver.validate(&data, &rules(), &AdjustableColumnSpec::default()).expect("validate");
        assert_eq!(resolver.stored_datasets(), 1);
        assert!(resolver.evict(&data.id));
        assert!(!resolver.evict(&data.id));
        assert!(resolver.validated(&data.id).is_none());
    }

    #[test]
    fn retention_drops_the_oldest_validation() {
        let resolver = ReportabilityResolver::default().with_retention(2);
        let ids = ["run-1/validate", "run-2/validate", "run-3/validate"];
        for id in &ids[..2] {
            let data = Dataset { id: DatasetId::new(*id), ..trades() };
            resolver.validate(&data, &rules(), &AdjustableColumnSpec::default()).expect("validate");
        }
        // Revalidating run-1 makes it the most recent, so run-2 goes first.
        let data = Dataset { id: DatasetId::new(ids[0]), ..trades() };
        resolver.validate(&data, &rules(), &AdjustableColumnSpec::default()).expect("validate");
        let data = Dataset { id: DatasetId::new(ids[2]), ..trades() };
        resolver.validate(&data, &rules(), &AdjustableColumnSpec::default()).expect("validate");

        assert_eq!(resolver.stored_datasets(), 2);
        assert!(resolver.validated(&ids[0].into()).is_some());
        assert!(resolver.validated(&ids[1].into()).is_none());
        assert!(resolver.validated(&ids[2].into()).is_some());
        assert_eq!(ReportabilityResolver::default().with_retention(0).retention(), 1);
    }

    #[test]
    fn evict_run_forgets_only_that_run() {
        let resolver = ReportabilityResolver::default();
        for id in ["run-1/validate", "run-1/recheck", "run-10/validate"] {
            let data = Dataset { id: DatasetId::new(id), ..trades() };
            resolver.validate(&data, &rules(), &AdjustableColumnSpec::default()).expect("validate");
        }
        assert_eq!(resolver.evict_run("run-1"), 2);
        assert_eq!(resolver.stored_datasets(), 1);
        assert!(resolver.validated(&"run-10/validate".into()).is_some());
        assert_eq!(resolver.evict_run("run-1"), 0);
    }
}

//! Rule evaluation.
//!
//! Every rule runs against every eligible row; one failing rule never hides another. Results are
//! first produced as annotations tagged with the rule's declaration index, then assembled in row
//! order and rule order. Reprocessing relies on this: it re-annotates part of a dataset and
//! reassembles, and the result is identical to a full run.

use std::collections::{HashMap, HashSet};

use regflow_types::{Dataset, Row, RowId, RuleFailure, RuleScope, Severity, ValidationOutcome};

use super::compile::{CompiledRule, CompiledRuleSet, RuleCheck};
use crate::templates::interpolate;
use crate::values::display_value;

/// A single failure before assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub row_id: RowId,
    pub rule_index: usize,
    pub scope: RuleScope,
    pub severity: Severity,
    pub failure: RuleFailure,
}

/// Which part of a rule set to evaluate.
#[derive(Debug, Clone, Copy)]
pub enum EvaluationTarget<'a> {
    /// Every rule over every row.
    Everything,
    /// FIELD and ROW rules over the listed rows only.
    RowRules(&'a HashSet<RowId>),
    /// CROSS_ROW rules over the whole dataset.
    CrossRowRules,
}

/// Assembled failures, split by severity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcomes {
    /// Failures that make a row non-reportable.
    pub errors: ValidationOutcome,
    pub warnings: ValidationOutcome,
}

/// Evaluates every rule of `rules` against `dataset`.
pub fn evaluate(dataset: &Dataset, rules: &CompiledRuleSet) -> RuleOutcomes {
    assemble(dataset, annotate(dataset, rules, EvaluationTarget::Everything))
}

pub fn annotate(dataset: &Dataset, rules: &CompiledRuleSet, target: EvaluationTarget<'_>) -> Vec<Annotation> {
    let mut annotations = Vec::new();
    for rule in rules.rules() {
        let cross_row = rule.scope() == RuleScope::CrossRow;
        match target {
            EvaluationTarget::Everything => {}
            EvaluationTarget::RowRules(_) if cross_row => continue,
            EvaluationTarget::CrossRowRules if !cross_row => continue,
            _ => {}
        }

        let rows: Vec<&Row> = match target {
            EvaluationTarget::RowRules(selected) => dataset.rows.iter().filter(|row| selected.contains(&row.id)).collect(),
            _ => dataset.rows.iter().collect(),
        };

        let missing: Vec<&str> = rule
            .columns
            .iter()
            .map(String::as_str)
            .filter(|column| !dataset.has_column(column))
            .collect();
        if !missing.is_empty() {
            for row in rows {
                for column in &missing {
                    let message = format!("missing field '{column}' referenced by rule '{}'", rule.id());
                    annotations.push(annotation(rule, row, RuleFailure::new(rule.id(), message)));
                }
            }
            continue;
        }

        match &rule.check {
            RuleCheck::Predicate(condition) => {
                for row in rows {
                    if rule.applies_to(row) && !condition.holds(row) {
                        annotations.push(annotation(rule, row, failure(rule, row)));
                    }
                }
            }
            RuleCheck::CrossRow { call, columns, .. } => {
                let participants: Vec<&Row> = rows.into_iter().filter(|row| rule.applies_to(row)).collect();
                for position in call(&participants, columns) {
                    if let Some(row) = participants.get(position) {
                        annotations.push(annotation(rule, row, failure(rule, row)));
                    }
                }
            }
        }
    }
    annotations
}

/// Orders annotations by row position then rule declaration order and splits them by severity.
/// Annotations for rows no longer in the dataset are dropped.
pub fn assemble(dataset: &Dataset, mut annotations: Vec<Annotation>) -> RuleOutcomes {
    let positions: HashMap<&RowId, usize> = dataset.rows.iter().enumerate().map(|(position, row)| (&row.id, position)).collect();
    annotations.retain(|annotation| positions.contains_key(&annotation.row_id));
    annotations.sort_by_key(|annotation| (positions[&annotation.row_id], annotation.rule_index));

    let mut outcomes = RuleOutcomes::default();
    for annotation in annotations {
        let outcome = match annotation.severity {
            Severity::Error => &mut outcomes.errors,
            Severity::Warning => &mut outcomes.warnings,
        };
        outcome.record(annotation.row_id, annotation.failure);
    }
    outcomes
}

fn annotation(rule: &CompiledRule, row: &Row, failure: RuleFailure) -> Annotation {
    Annotation {
        row_id: row.id.clone(),
        rule_index: rule.index,
        scope: rule.scope(),
        severity: rule.rule.severity,
        failure,
    }
}

fn failure(rule: &CompiledRule, row: &Row) -> RuleFailure {
    let message = match &rule.rule.message {
        Some(template) => interpolate(template, |expression| row.values.get(expression).map(display_value)),
        None => format!("rule '{}' failed", rule.id()),
    };
    RuleFailure::new(rule.id(), message)
}

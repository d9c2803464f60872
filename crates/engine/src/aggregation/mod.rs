//! Aggregation pipeline.
//!
//! Rules apply strictly in order; the output of one rule is the input of the next. Everything that
//! can be checked without data is checked up front by [`AggregationPipeline::check_rules`], which
//! the orchestrator also runs before a workflow starts.

pub mod functions;
pub mod strategies;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regflow_types::{AggregationKind, AggregationRule, Dataset};
use tracing::debug;

pub use functions::{AggregateFunction, AggregationFunctions, ResultType};

use crate::error::{AggregationError, ConfigurationError};

/// A user-supplied strategy for `CUSTOM` rules, selected by the rule's `custom` name.
pub trait CustomAggregation: Send + Sync {
    fn apply(&self, dataset: &Dataset, rule: &AggregationRule) -> anyhow::Result<Dataset>;
}

impl<F> CustomAggregation for F
where
    F: Fn(&Dataset, &AggregationRule) -> anyhow::Result<Dataset> + Send + Sync,
{
    fn apply(&self, dataset: &Dataset, rule: &AggregationRule) -> anyhow::Result<Dataset> {
        self(dataset, rule)
    }
}

#[derive(Clone)]
pub struct AggregationPipeline {
    functions: AggregationFunctions,
    custom: HashMap<String, Arc<dyn CustomAggregation>>,
}

impl fmt::Debug for AggregationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom: Vec<&str> = self.custom.keys().map(String::as_str).collect();
        custom.sort_unstable();
        f.debug_struct("AggregationPipeline")
            .field("functions", &self.functions)
            .field("custom", &custom)
            .finish()
    }
}

impl Default for AggregationPipeline {
    fn default() -> Self {
        Self::new(AggregationFunctions::with_builtins())
    }
}

impl AggregationPipeline {
    pub fn new(functions: AggregationFunctions) -> Self {
        Self {
            functions,
            custom: HashMap::new(),
        }
    }

    pub fn register_custom(&mut self, name: impl Into<String>, handler: Arc<dyn CustomAggregation>) {
        self.custom.insert(name.into(), handler);
    }

    /// Checks rule types, function names, and custom handler names.
    pub fn check_rules(&self, rules: &[AggregationRule]) -> Result<(), ConfigurationError> {
        for rule in rules {
            match &rule.kind {
                AggregationKind::Unrecognized(kind) => {
                    return Err(ConfigurationError::UnknownAggregationType {
                        rule_id: rule.id.clone(),
                        kind: kind.clone(),
                    });
                }
                AggregationKind::Custom => {
                    self.custom_handler(rule)?;
                }
                AggregationKind::Pivot if rule.pivot_column.is_none() => {
                    return Err(ConfigurationError::malformed_aggregation(&rule.id, "PIVOT rules require a pivot_column"));
                }
                _ => {}
            }

            if rule.kind != AggregationKind::Custom
                && let Some(column) = rule.columns.iter().find(|column| self.functions.get(&column.function).is_none())
            {
                return Err(ConfigurationError::UnknownAggregationFunction {
                    rule_id: rule.id.clone(),
                    function: column.function.clone(),
                });
            }
        }
        Ok(())
    }

    /// Applies every rule in order. Rules are checked before any is applied.
    pub fn aggregate(&self, dataset: &Dataset, rules: &[AggregationRule]) -> Result<Dataset, AggregationError> {
        self.check_rules(rules)?;
        let mut current = dataset.clone();
        for rule in rules {
            current = self.apply_rule(&current, rule)?;
            debug!(rule = %rule.id, kind = %rule.kind, rows = current.len(), dataset = %current.id, "aggregation rule applied");
        }
        Ok(current)
    }

    pub fn apply_rule(&self, dataset: &Dataset, rule: &AggregationRule) -> Result<Dataset, AggregationError> {
        let output = match &rule.kind {
            AggregationKind::GroupBy => strategies::group_by(dataset, rule, &self.functions)?,
            AggregationKind::Pivot => strategies::pivot(dataset, rule, &self.functions)?,
            AggregationKind::Window => strategies::window(dataset, rule, &self.functions)?,
            AggregationKind::Custom => {
                let handler = self.custom_handler(rule)?;
                handler.apply(dataset, rule).map_err(|source| AggregationError::Handler {
                    rule_id: rule.id.clone(),
                    source,
                })?
            }
            AggregationKind::Unrecognized(kind) => {
                return Err(ConfigurationError::UnknownAggregationType {
                    rule_id: rule.id.clone(),
                    kind: kind.clone(),
                }
                .into());
            }
        };
        Ok(output)
    }

    fn custom_handler(&self, rule: &AggregationRule) -> Result<&Arc<dyn CustomAggregation>, ConfigurationError> {
        let Some(name) = rule.custom.as_deref() else {
            return Err(ConfigurationError::malformed_aggregation(&rule.id, "CUSTOM rules must name a handler"));
        };
        self.custom.get(name).ok_or_else(|| ConfigurationError::UnknownAggregationType {
            rule_id: rule.id.clone(),
            kind: format!("CUSTOM:{name}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use regflow_types::{AggregationColumn, Column, ColumnType, Row, Schema};
    use serde_json::json;

    use super::*;

    fn dataset() -> Dataset {
        let schema = Schema::new(vec![Column::new("g", ColumnType::String), Column::new("v", ColumnType::Integer)]);
        Dataset::new("d", schema).with_rows(vec![
            Row::new("1").with("g", json!("A")).with("v", json!(10)),
            Row::new("2").with("g", json!("A")).with("v", json!(20)),
            Row::new("3").with("g", json!("B")).with("v", json!(5)),
        ])
    }

    #[test]
    fn rules_chain_in_order() {
        let pipeline = AggregationPipeline::default();
        let rules = [
            AggregationRule::group_by("by_g", &["g"], vec![AggregationColumn::new("v", "total", "SUM")]),
            AggregationRule::group_by("overall", &[], vec![AggregationColumn::new("total", "max_total", "MAX")]),
        ];
        let output = pipeline.aggregate(&dataset(), &rules).expect("aggregate");
        assert_eq!(output.id.as_str(), "d.by_g.overall");
        assert_eq!(output.rows[0].get("max_total"), &json!(30));
    }

    #[test]
    fn unknown_type_fails_before_any_rule_runs() {
        let pipeline = AggregationPipeline::default();
        let mut bad = AggregationRule::group_by("bad", &[], Vec::new());
        bad.kind = AggregationKind::Unrecognized("ROLLUP".into());
        let error = pipeline
            .aggregate(&dataset(), &[AggregationRule::group_by("ok", &["g"], Vec::new()), bad])
            .expect_err("unknown type");
        assert!(matches!(
            error,
            AggregationError::Configuration(ConfigurationError::UnknownAggregationType { ref kind, .. }) if kind == "ROLLUP"
        ));
    }

    #[test]
    fn custom_handlers_are_dispatched_by_name() {
        let mut pipeline = AggregationPipeline::default();
        pipeline.register_custom(
            "top_row",
            Arc::new(|dataset: &Dataset, rule: &AggregationRule| -> anyhow::Result<Dataset> {
                Ok(dataset.derive(&rule.id, dataset.rows.iter().take(1).cloned().collect()))
            }),
        );
        pipeline.register_custom(
            "broken",
            Arc::new(|_: &Dataset, _: &AggregationRule| -> anyhow::Result<Dataset> { bail!("upstream feed closed") }),
        );

        let mut rule = AggregationRule::group_by("first", &[], Vec::new());
        rule.kind = AggregationKind::Custom;
        rule.custom = Some("top_row".into());
        assert_eq!(pipeline.aggregate(&dataset(), &[rule.clone()]).expect("custom").len(), 1);

        rule.custom = Some("broken".into());
        let error = pipeline.aggregate(&dataset(), &[rule.clone()]).expect_err("handler error");
        assert!(error.to_string().contains("upstream feed closed"), "{error}");

        rule.custom = Some("missing".into());
        assert!(matches!(
            pipeline.check_rules(&[rule]),
            Err(ConfigurationError::UnknownAggregationType { .. })
        ));
    }

    #[test]
    fn check_rules_reports_unknown_functions() {
        let pipeline = AggregationPipeline::default();
        let rule = AggregationRule::group_by("r", &["g"], vec![AggregationColumn::new("v", "m", "median")]);
        assert!(matches!(
            pipeline.check_rules(&[rule]),
            Err(ConfigurationError::UnknownAggregationFunction { .. })
        ));
    }
}

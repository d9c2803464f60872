//! Built-in aggregation strategies.
//!
//! Each strategy maps `(Dataset, AggregationRule)` to a new dataset. Partitions follow the first
//! appearance of each key so outputs are stable for a given input order.

use indexmap::IndexMap;
use regflow_types::{AggregationColumn, AggregationRule, Column, ColumnType, Dataset, Row, Schema};
use serde_json::Value;

use super::functions::{AggregateFunction, AggregationFunctions};
use crate::error::ConfigurationError;
use crate::values::{compare_values, display_value, group_key};

struct Partition<'a> {
    key: Vec<Value>,
    rows: Vec<&'a Row>,
}

struct BoundColumn<'a> {
    column: &'a AggregationColumn,
    function: &'a AggregateFunction,
    output_type: ColumnType,
}

impl BoundColumn<'_> {
    fn apply(&self, rows: &[&Row]) -> Value {
        let values: Vec<&Value> = rows.iter().map(|row| row.get(&self.column.input)).collect();
        (self.function.call)(&values)
    }
}

pub fn group_by(dataset: &Dataset, rule: &AggregationRule, functions: &AggregationFunctions) -> Result<Dataset, ConfigurationError> {
    require_columns(dataset, rule, rule.group_by.iter())?;
    let bound = bind_columns(dataset, rule, functions)?;

    let mut schema = key_schema(dataset, rule);
    for column in &bound {
        schema.push(Column::new(&column.column.output, column.output_type));
    }

    let partitions = partition(dataset.rows.iter(), &rule.group_by);
    let rows = partitions
        .iter()
        .enumerate()
        .map(|(index, partition)| {
            let mut row = key_row(rule, index, partition);
            for column in &bound {
                row.set(column.column.output.clone(), column.apply(&partition.rows));
            }
            row
        })
        .collect();

    Ok(Dataset {
        id: dataset.id.derived(&rule.id),
        schema,
        rows,
    })
}

pub fn pivot(dataset: &Dataset, rule: &AggregationRule, functions: &AggregationFunctions) -> Result<Dataset, ConfigurationError> {
    let Some(pivot_column) = rule.pivot_column.as_deref() else {
        return Err(ConfigurationError::malformed_aggregation(&rule.id, "PIVOT rules require a pivot_column"));
    };
    require_columns(dataset, rule, rule.group_by.iter().chain(std::iter::once(&pivot_column.to_string())))?;
    let bound = bind_columns(dataset, rule, functions)?;

    let mut pivot_values: IndexMap<String, String> = IndexMap::new();
    for row in &dataset.rows {
        let cell = row.get(pivot_column);
        pivot_values.entry(group_key([cell])).or_insert_with(|| pivot_label(cell));
    }

    let mut schema = key_schema(dataset, rule);
    for label in pivot_values.values() {
        for column in &bound {
            schema.push(Column::new(format!("{label}_{}", column.column.output), column.output_type));
        }
    }

    let partitions = partition(dataset.rows.iter(), &rule.group_by);
    let rows = partitions
        .iter()
        .enumerate()
        .map(|(index, partition)| {
            let mut row = key_row(rule, index, partition);
            for (pivot_key, label) in &pivot_values {
                let slice: Vec<&Row> = partition
                    .rows
                    .iter()
                    .copied()
                    .filter(|row| &group_key([row.get(pivot_column)]) == pivot_key)
                    .collect();
                for column in &bound {
                    row.set(format!("{label}_{}", column.column.output), column.apply(&slice));
                }
            }
            row
        })
        .collect();

    Ok(Dataset {
        id: dataset.id.derived(&rule.id),
        schema,
        rows,
    })
}

/// Keeps every input row and appends one column per aggregation output.
pub fn window(dataset: &Dataset, rule: &AggregationRule, functions: &AggregationFunctions) -> Result<Dataset, ConfigurationError> {
    require_columns(dataset, rule, rule.group_by.iter().chain(rule.order_by.iter()))?;
    let bound = bind_columns(dataset, rule, functions)?;

    let mut schema = dataset.schema.clone();
    for column in &bound {
        schema.push(Column::new(&column.column.output, column.output_type));
    }

    let mut rows = dataset.rows.clone();
    let mut partitions: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (position, row) in dataset.rows.iter().enumerate() {
        let key = group_key(rule.group_by.iter().map(|column| row.get(column)));
        partitions.entry(key).or_default().push(position);
    }

    for members in partitions.values() {
        match rule.order_by.as_deref() {
            None => {
                let members_rows: Vec<&Row> = members.iter().map(|position| &dataset.rows[*position]).collect();
                for column in &bound {
                    let value = column.apply(&members_rows);
                    for position in members {
                        rows[*position].set(column.column.output.clone(), value.clone());
                    }
                }
            }
            Some(order_column) => {
                let mut ordered = members.clone();
                ordered.sort_by(|left, right| {
                    let (left, right) = (dataset.rows[*left].get(order_column), dataset.rows[*right].get(order_column));
                    compare_values(left, right).unwrap_or_else(|| null_last(left, right))
                });
                for (end, position) in ordered.iter().enumerate() {
                    let running: Vec<&Row> = ordered[..=end].iter().map(|position| &dataset.rows[*position]).collect();
                    for column in &bound {
                        rows[*position].set(column.column.output.clone(), column.apply(&running));
                    }
                }
            }
        }
    }

    Ok(Dataset {
        id: dataset.id.derived(&rule.id),
        schema,
        rows,
    })
}

fn null_last(left: &Value, right: &Value) -> std::cmp::Ordering {
    left.is_null().cmp(&right.is_null())
}

fn pivot_label(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => display_value(other),
    }
}

fn require_columns<'a>(
    dataset: &Dataset,
    rule: &AggregationRule,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<(), ConfigurationError> {
    for column in columns {
        if !dataset.has_column(column) {
            return Err(ConfigurationError::malformed_aggregation(
                &rule.id,
                format!("unknown column '{column}' in dataset '{}'", dataset.id),
            ));
        }
    }
    Ok(())
}

fn bind_columns<'a>(
    dataset: &Dataset,
    rule: &'a AggregationRule,
    functions: &'a AggregationFunctions,
) -> Result<Vec<BoundColumn<'a>>, ConfigurationError> {
    require_columns(dataset, rule, rule.columns.iter().map(|column| &column.input))?;
    rule.columns
        .iter()
        .map(|column| {
            let function = functions.get(&column.function).ok_or_else(|| ConfigurationError::UnknownAggregationFunction {
                rule_id: rule.id.clone(),
                function: column.function.clone(),
            })?;
            let input_type = dataset.schema.column(&column.input).map(|input| input.r#type);
            Ok(BoundColumn {
                column,
                function,
                output_type: function.result_type.resolve(input_type),
            })
        })
        .collect()
}

fn key_schema(dataset: &Dataset, rule: &AggregationRule) -> Schema {
    let mut schema = Schema::default();
    for key in &rule.group_by {
        let column_type = dataset.schema.column(key).map(|column| column.r#type).unwrap_or_default();
        schema.push(Column::new(key, column_type));
    }
    schema
}

fn key_row(rule: &AggregationRule, index: usize, partition: &Partition<'_>) -> Row {
    let mut row = Row::new(format!("{}#{}", rule.id, index + 1));
    for (key, value) in rule.group_by.iter().zip(&partition.key) {
        row.set(key.clone(), value.clone());
    }
    row
}

/// Partitions rows by key tuple. With no key columns every row (possibly none) forms one partition.
fn partition<'a>(rows: impl Iterator<Item = &'a Row>, keys: &[String]) -> Vec<Partition<'a>> {
    let mut partitions: IndexMap<String, Partition<'a>> = IndexMap::new();
    if keys.is_empty() {
        partitions.insert(String::new(), Partition { key: Vec::new(), rows: Vec::new() });
    }
    for row in rows {
        let key = group_key(keys.iter().map(|column| row.get(column)));
        partitions
            .entry(key)
            .or_insert_with(|| Partition {
                key: keys.iter().map(|column| row.get(column).clone()).collect(),
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }
    partitions.into_values().collect()
}

#[cfg(test)]
mod tests {
    use regflow_types::AggregationKind;
    use serde_json::json;

    use super::*;

    fn trades() -> Dataset {
        let schema = Schema::new(vec![
            Column::new("desk", ColumnType::String),
            Column::new("ccy", ColumnType::String),
            Column::new("day", ColumnType::Integer),
            Column::new("v", ColumnType::Integer),
        ]);
        Dataset::new("trades", schema).with_rows(vec![
            Row::new("1").with("desk", json!("A")).with("ccy", json!("EUR")).with("day", json!(2)).with("v", json!(10)),
            Row::new("2").with("desk", json!("B")).with("ccy", json!("USD")).with("day", json!(1)).with("v", json!(5)),
            Row::new("3").with("desk", json!("A")).with("ccy", json!("USD")).with("day", json!(1)).with("v", json!(20)),
        ])
    }

    fn rule(kind: AggregationKind, keys: &[&str], columns: Vec<AggregationColumn>) -> AggregationRule {
        AggregationRule {
            kind,
            ..AggregationRule::group_by("r", keys, columns)
        }
    }

    #[test]
    fn group_by_preserves_first_appearance() {
        let functions = AggregationFunctions::with_builtins();
        let rule = AggregationRule::group_by(
            "by_desk",
            &["desk"],
            vec![
                AggregationColumn::new("v", "total", "SUM"),
                AggregationColumn::new("v", "trades", "count"),
            ],
        );
        let output = group_by(&trades(), &rule, &functions).expect("aggregate");
        assert_eq!(output.id.as_str(), "trades.by_desk");
        assert_eq!(output.schema.names().collect::<Vec<_>>(), vec!["desk", "total", "trades"]);
        assert_eq!(output.rows[0].get("desk"), &json!("A"));
        assert_eq!(output.rows[0].get("total"), &json!(30));
        assert_eq!(output.rows[0].get("trades"), &json!(2));
        assert_eq!(output.rows[1].id.as_str(), "by_desk#2");
        assert_eq!(output.rows[1].get("total"), &json!(5));
    }

    #[test]
    fn group_by_without_keys_is_a_grand_total() {
        let functions = AggregationFunctions::with_builtins();
        let rule = AggregationRule::group_by("all", &[], vec![AggregationColumn::new("v", "total", "SUM")]);
        let output = group_by(&trades(), &rule, &functions).expect("aggregate");
        assert_eq!(output.len(), 1);
        assert_eq!(output.rows[0].get("total"), &json!(35));

        let empty = trades().derive("empty", Vec::new());
        let output = group_by(&empty, &rule, &functions).expect("aggregate");
        assert_eq!(output.rows[0].get("total"), &json!(0));
    }

    #[test]
    fn unknown_columns_and_functions_are_configuration_errors() {
        let functions = AggregationFunctions::with_builtins();
        let missing = AggregationRule::group_by("r", &["region"], Vec::new());
        assert!(matches!(
            group_by(&trades(), &missing, &functions),
            Err(ConfigurationError::MalformedAggregation { .. })
        ));
        let unknown = AggregationRule::group_by("r", &["desk"], vec![AggregationColumn::new("v", "m", "MEDIAN")]);
        assert!(matches!(
            group_by(&trades(), &unknown, &functions),
            Err(ConfigurationError::UnknownAggregationFunction { ref function, .. }) if function == "MEDIAN"
        ));
    }

    #[test]
    fn pivot_spreads_values_into_columns() {
        let functions = AggregationFunctions::with_builtins();
        let mut pivot_rule = rule(AggregationKind::Pivot, &["desk"], vec![AggregationColumn::new("v", "total", "SUM")]);
        pivot_rule.pivot_column = Some("ccy".into());

        let output = pivot(&trades(), &pivot_rule, &functions).expect("pivot");
        assert_eq!(output.schema.names().collect::<Vec<_>>(), vec!["desk", "EUR_total", "USD_total"]);
        assert_eq!(output.rows[0].get("EUR_total"), &json!(10));
        assert_eq!(output.rows[0].get("USD_total"), &json!(20));
        assert_eq!(output.rows[1].get("EUR_total"), &json!(0));
        assert_eq!(output.rows[1].get("USD_total"), &json!(5));

        pivot_rule.pivot_column = None;
        assert!(pivot(&trades(), &pivot_rule, &functions).is_err());
    }

    #[test]
    fn window_appends_partition_and_running_values() {
        let functions = AggregationFunctions::with_builtins();
        let partition_rule = rule(AggregationKind::Window, &["desk"], vec![AggregationColumn::new("v", "desk_total", "SUM")]);
        let output = window(&trades(), &partition_rule, &functions).expect("window");
        assert_eq!(output.len(), 3);
        assert_eq!(output.rows[0].get("desk_total"), &json!(30));
        assert_eq!(output.rows[1].get("desk_total"), &json!(5));
        assert_eq!(output.rows[2].get("v"), &json!(20));
        assert_eq!(output.schema.len(), 5);

        let mut running_rule = rule(AggregationKind::Window, &[], vec![AggregationColumn::new("v", "running", "SUM")]);
        running_rule.order_by = Some("day".into());
        let output = window(&trades(), &running_rule, &functions).expect("window");
        // day order: row 2 (day 1), row 3 (day 1), row 1 (day 2)
        assert_eq!(output.rows[1].get("running"), &json!(5));
        assert_eq!(output.rows[2].get("running"), &json!(25));
        assert_eq!(output.rows[0].get("running"), &json!(35));
    }
}

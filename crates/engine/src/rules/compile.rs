//! Rule compilation.
//!
//! A report's rules are parsed, checked against the function registries, and bound to column
//! names once. The resulting [`CompiledRuleSet`] is immutable and shared behind an `Arc`, so
//! concurrent validations of the same report never re-parse or re-compile anything.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use regex::Regex;
use regflow_types::{Row, RuleScope, ValidationRule};
use serde_json::Value;

use super::functions::{CrossRowFn, FunctionRegistry, MATCHES_FUNCTION, PredicateFn};
use super::syntax::{CompareOp, Expr, parse_condition};
use crate::error::ConfigurationError;
use crate::values::{compare_values, display_value, is_truthy, values_equal};

/// An expression bound to registry functions.
#[derive(Clone)]
pub enum CompiledExpr {
    Literal(Value),
    Column(String),
    List(Vec<CompiledExpr>),
    Not(Box<CompiledExpr>),
    And(Vec<CompiledExpr>),
    Or(Vec<CompiledExpr>),
    Compare {
        op: CompareOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Call {
        name: String,
        call: PredicateFn,
        args: Vec<CompiledExpr>,
    },
    Matches {
        subject: Box<CompiledExpr>,
        pattern: Regex,
    },
}

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledExpr::Literal(value) => write!(f, "Literal({value})"),
            CompiledExpr::Column(name) => write!(f, "Column({name})"),
            CompiledExpr::List(items) => f.debug_tuple("List").field(items).finish(),
            CompiledExpr::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            CompiledExpr::And(items) => f.debug_tuple("And").field(items).finish(),
            CompiledExpr::Or(items) => f.debug_tuple("Or").field(items).finish(),
            CompiledExpr::Compare { op, left, right } => {
                f.debug_struct("Compare").field("op", op).field("left", left).field("right", right).finish()
            }
            CompiledExpr::Call { name, args, .. } => f.debug_struct("Call").field("name", name).field("args", args).finish(),
            CompiledExpr::Matches { subject, pattern } => f
                .debug_struct("Matches")
                .field("subject", subject)
                .field("pattern", &pattern.as_str())
                .finish(),
        }
    }
}

impl CompiledExpr {
    pub fn evaluate(&self, row: &Row) -> Value {
        match self {
            CompiledExpr::Literal(value) => value.clone(),
            CompiledExpr::Column(name) => row.get(name).clone(),
            CompiledExpr::List(items) => Value::Array(items.iter().map(|item| item.evaluate(row)).collect()),
            CompiledExpr::Not(inner) => Value::Bool(!inner.holds(row)),
            CompiledExpr::And(items) => Value::Bool(items.iter().all(|item| item.holds(row))),
            CompiledExpr::Or(items) => Value::Bool(items.iter().any(|item| item.holds(row))),
            CompiledExpr::Compare { op, left, right } => {
                let (left, right) = (left.evaluate(row), right.evaluate(row));
                let outcome = match op {
                    CompareOp::Eq => values_equal(&left, &right),
                    CompareOp::Ne => !values_equal(&left, &right),
                    ordering => compare_values(&left, &right).is_some_and(|found| match ordering {
                        CompareOp::Lt => found.is_lt(),
                        CompareOp::Le => found.is_le(),
                        CompareOp::Gt => found.is_gt(),
                        _ => found.is_ge(),
                    }),
                };
                Value::Bool(outcome)
            }
            CompiledExpr::Call { call, args, .. } => {
                let values: Vec<Value> = args.iter().map(|arg| arg.evaluate(row)).collect();
                call(&values)
            }
            CompiledExpr::Matches { subject, pattern } => match subject.evaluate(row) {
                Value::Null => Value::Bool(false),
                value => Value::Bool(pattern.is_match(&display_value(&value))),
            },
        }
    }

    pub fn holds(&self, row: &Row) -> bool {
        is_truthy(&self.evaluate(row))
    }
}

/// How a compiled rule decides failures.
#[derive(Clone)]
pub enum RuleCheck {
    /// FIELD and ROW rules: the row fails when the condition does not hold.
    Predicate(CompiledExpr),
    /// CROSS_ROW rules: a registered check over all participating rows.
    CrossRow {
        name: String,
        call: CrossRowFn,
        columns: Vec<String>,
    },
}

impl fmt::Debug for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCheck::Predicate(expression) => f.debug_tuple("Predicate").field(expression).finish(),
            RuleCheck::CrossRow { name, columns, .. } => {
                f.debug_struct("CrossRow").field("name", name).field("columns", columns).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Declaration order within the rule set.
    pub index: usize,
    pub rule: ValidationRule,
    pub guard: Option<CompiledExpr>,
    pub check: RuleCheck,
    /// Every column the condition, guard, and field reference, in first-use order.
    pub columns: Vec<String>,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    pub fn scope(&self) -> RuleScope {
        self.rule.scope
    }

    pub fn applies_to(&self, row: &Row) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard.holds(row))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// Compiles rules in declaration order. The first malformed rule aborts compilation.
    pub fn compile(rules: &[ValidationRule], registry: &FunctionRegistry) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigurationError::malformed_rule(&rule.id, "duplicate rule id"));
            }
            compiled.push(compile_rule(index, rule, registry)?);
        }
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// True when this set was compiled from exactly `rules`.
    pub fn compiled_from(&self, rules: &[ValidationRule]) -> bool {
        self.rules.len() == rules.len() && self.rules.iter().zip(rules).all(|(compiled, rule)| &compiled.rule == rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(index: usize, rule: &ValidationRule, registry: &FunctionRegistry) -> Result<CompiledRule, ConfigurationError> {
    let parsed = parse_condition(&rule.condition)
        .map_err(|error| ConfigurationError::malformed_rule(&rule.id, format!("invalid condition: {error}")))?;

    let guard_expr = rule
        .when
        .as_deref()
        .map(|when| {
            parse_condition(when)
                .map_err(|error| ConfigurationError::malformed_rule(&rule.id, format!("invalid guard: {error}")))
        })
        .transpose()?;

    let mut columns = Vec::new();
    if let Some(field) = &rule.field {
        columns.push(field.clone());
    }
    for column in parsed.columns().into_iter().chain(guard_expr.iter().flat_map(Expr::columns)) {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }

    let check = match rule.scope {
        RuleScope::CrossRow => compile_cross_row(rule, &parsed, registry)?,
        RuleScope::Field => {
            let Some(field) = rule.field.as_deref() else {
                return Err(ConfigurationError::malformed_rule(&rule.id, "FIELD rules must name a field"));
            };
            if let Some(other) = parsed.columns().into_iter().find(|column| column != field) {
                return Err(ConfigurationError::malformed_rule(
                    &rule.id,
                    format!("FIELD rule on '{field}' references another column '{other}'"),
                ));
            }
            RuleCheck::Predicate(compile_expr(&rule.id, &parsed, registry)?)
        }
        RuleScope::Row => RuleCheck::Predicate(compile_expr(&rule.id, &parsed, registry)?),
    };

    let guard = guard_expr.map(|expr| compile_expr(&rule.id, &expr, registry)).transpose()?;

    Ok(CompiledRule {
        index,
        rule: rule.clone(),
        guard,
        check,
        columns,
    })
}

fn compile_cross_row(rule: &ValidationRule, parsed: &Expr, registry: &FunctionRegistry) -> Result<RuleCheck, ConfigurationError> {
    let Expr::Call { function, args } = parsed else {
        return Err(ConfigurationError::malformed_rule(
            &rule.id,
            "CROSS_ROW condition must be a single cross-row check such as unique(column)",
        ));
    };
    let Some(check) = registry.cross_row(function) else {
        return Err(ConfigurationError::malformed_rule(&rule.id, format!("unknown cross-row check '{function}'")));
    };
    if !check.arity.accepts(args.len()) {
        return Err(ConfigurationError::malformed_rule(
            &rule.id,
            format!("'{function}' expects {} column arguments, got {}", check.arity, args.len()),
        ));
    }
    let columns = args
        .iter()
        .map(|arg| match arg {
            Expr::Column(name) => Ok(name.clone()),
            _ => Err(ConfigurationError::malformed_rule(
                &rule.id,
                format!("arguments of '{function}' must be column names"),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RuleCheck::CrossRow {
        name: function.clone(),
        call: check.call.clone(),
        columns,
    })
}

fn compile_expr(rule_id: &str, expr: &Expr, registry: &FunctionRegistry) -> Result<CompiledExpr, ConfigurationError> {
    let compile_all = |items: &[Expr]| -> Result<Vec<CompiledExpr>, ConfigurationError> {
        items.iter().map(|item| compile_expr(rule_id, item, registry)).collect()
    };

    Ok(match expr {
        Expr::Literal(value) => CompiledExpr::Literal(value.clone()),
        Expr::Column(name) => CompiledExpr::Column(name.clone()),
        Expr::List(items) => CompiledExpr::List(compile_all(items)?),
        Expr::Not(inner) => CompiledExpr::Not(Box::new(compile_expr(rule_id, inner, registry)?)),
        Expr::And(items) => CompiledExpr::And(compile_all(items)?),
        Expr::Or(items) => CompiledExpr::Or(compile_all(items)?),
        Expr::Compare { op, left, right } => CompiledExpr::Compare {
            op: *op,
            left: Box::new(compile_expr(rule_id, left, registry)?),
            right: Box::new(compile_expr(rule_id, right, registry)?),
        },
        Expr::Call { function, args } if function == MATCHES_FUNCTION => {
            let [subject, Expr::Literal(Value::String(pattern))] = args.as_slice() else {
                return Err(ConfigurationError::malformed_rule(
                    rule_id,
                    "'matches' expects a value and a literal pattern string",
                ));
            };
            let pattern = Regex::new(pattern)
                .map_err(|error| ConfigurationError::malformed_rule(rule_id, format!("invalid pattern: {error}")))?;
            CompiledExpr::Matches {
                subject: Box::new(compile_expr(rule_id, subject, registry)?),
                pattern,
            }
        }
        Expr::Call { function, args } => {
            if registry.cross_row(function).is_some() {
                return Err(ConfigurationError::malformed_rule(
                    rule_id,
                    format!("cross-row check '{function}' is only allowed in CROSS_ROW rules"),
                ));
            }
            let Some(predicate) = registry.predicate(function) else {
                return Err(ConfigurationError::malformed_rule(rule_id, format!("unknown function '{function}'")));
            };
            if !predicate.arity.accepts(args.len()) {
                return Err(ConfigurationError::malformed_rule(
                    rule_id,
                    format!("'{function}' expects {} arguments, got {}", predicate.arity, args.len()),
                ));
            }
            CompiledExpr::Call {
                name: function.clone(),
                call: predicate.call.clone(),
                args: compile_all(args)?,
            }
        }
    })
}

/// Compiled rule sets keyed by report id. Entries are built once and shared until the report's
/// rules change or the cache is cleared.
#[derive(Debug, Default)]
pub struct RuleSetCache {
    entries: Mutex<HashMap<String, Arc<CompiledRuleSet>>>,
}

impl RuleSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &self,
        report_id: &str,
        rules: &[ValidationRule],
        registry: &FunctionRegistry,
    ) -> Result<Arc<CompiledRuleSet>, ConfigurationError> {
        let mut entries = self.entries.lock().expect("rule set cache lock poisoned");
        if let Some(existing) = entries.get(report_id)
            && existing.compiled_from(rules)
        {
            return Ok(existing.clone());
        }
        let compiled = Arc::new(CompiledRuleSet::compile(rules, registry)?);
        entries.insert(report_id.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn clear(&self) {
        self.entries.lock().expect("rule set cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("rule set cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

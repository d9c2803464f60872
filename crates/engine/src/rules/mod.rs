//! Rule evaluation core: condition syntax, function registries, compilation, and evaluation.

pub mod compile;
pub mod evaluate;
pub mod functions;
pub mod syntax;

pub use compile::{CompiledExpr, CompiledRule, CompiledRuleSet, RuleCheck, RuleSetCache};
pub use evaluate::{Annotation, EvaluationTarget, RuleOutcomes, annotate, assemble, evaluate};
pub use functions::{Arity, FunctionRegistry};
pub use syntax::{CompareOp, Expr, SyntaxError, parse_condition};

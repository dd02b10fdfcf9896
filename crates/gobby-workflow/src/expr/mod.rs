//! Safe AST-based expression evaluation.
//!
//! Conditions in workflow YAML (`when`, `exit_when`, rule conditions) are a
//! restricted infix expression language. Expressions are parsed into an AST
//! whose node kinds form a closed allow-list and walked against a context
//! map: there is no dynamic eval anywhere.

pub mod ast;
pub mod eval;
pub mod helpers;
pub mod value;

pub use ast::{Expr, ParseError, parse};
pub use eval::{ConditionEvaluator, EvalError, HelperFn, HelperTable, eval};
pub use helpers::{HelperSources, build_condition_helpers, generic_helpers};
pub use value::{LazyBool, Value};

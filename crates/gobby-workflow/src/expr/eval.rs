//! AST walker for condition expressions.
//!
//! Walks the parsed expression against a context map and an allow-listed
//! function table. Every node kind outside the allow-list was already
//! rejected by the parser; this module enforces the value-level rules: which
//! methods exist on which types, which functions may be called, and what an
//! unknown name does (it fails the expression).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::expr::ast::{self, BoolOp, CmpOp, Expr, UnaryOp};
use crate::expr::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("{0}")]
    Parse(#[from] ast::ParseError),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Function not allowed: {0}")]
    FunctionNotAllowed(String),

    #[error("Unsupported method call: {type_name}.{method}")]
    UnsupportedMethod { type_name: &'static str, method: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Subscript access failed: {0}")]
    Subscript(String),

    #[error("Unsupported comparison between {left} and {right}")]
    Comparison { left: &'static str, right: &'static str },

    #[error("{0}")]
    Helper(String),
}

/// An allow-listed function callable from expressions.
pub type HelperFn = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Function table built at the call site (see `expr::helpers`).
#[derive(Default, Clone)]
pub struct HelperTable {
    funcs: HashMap<String, HelperFn>,
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, func: HelperFn) {
        self.funcs.insert(name.into(), func);
    }

    pub fn get(&self, name: &str) -> Option<&HelperFn> {
        self.funcs.get(name)
    }

    pub fn merge(&mut self, other: &HelperTable) {
        for (name, func) in &other.funcs {
            self.funcs.insert(name.clone(), func.clone());
        }
    }
}

/// Evaluate a parsed expression against a context.
pub fn eval(expr: &Expr, ctx: &BTreeMap<String, Value>, helpers: &HelperTable) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, ctx, helpers)?);
            }
            Ok(Value::List(values))
        }
        Expr::Tuple(items) => {
            // Tuples behave as lists in the value universe.
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, ctx, helpers)?);
            }
            Ok(Value::List(values))
        }
        Expr::Attribute { value, attr } => {
            let object = eval(value, ctx, helpers)?;
            match object {
                Value::Map(map) => map
                    .get(attr.as_str())
                    .cloned()
                    .ok_or_else(|| EvalError::KeyNotFound(attr.clone())),
                other => Err(EvalError::UnsupportedMethod {
                    type_name: other.type_name(),
                    method: attr.clone(),
                }),
            }
        }
        Expr::Subscript { value, index } => {
            let object = eval(value, ctx, helpers)?;
            let key = eval(index, ctx, helpers)?;
            subscript(&object, &key)
        }
        Expr::Call { func, args } => {
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                arg_values.push(eval(arg, ctx, helpers)?);
            }
            match func.as_ref() {
                Expr::Name(name) => {
                    let helper = helpers
                        .get(name)
                        .ok_or_else(|| EvalError::FunctionNotAllowed(name.clone()))?;
                    helper(&arg_values)
                }
                Expr::Attribute { value, attr } => {
                    let object = eval(value, ctx, helpers)?;
                    call_method(&object, attr, &arg_values)
                }
                other => Err(EvalError::Helper(format!(
                    "unsupported call target: {other:?}"
                ))),
            }
        }
        Expr::Unary { op, operand } => {
            let value = eval(operand, ctx, helpers)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EvalError::Helper(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
                UnaryOp::Pos => match value {
                    Value::Int(_) | Value::Float(_) => Ok(value),
                    other => Err(EvalError::Helper(format!(
                        "cannot apply unary + to {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::BoolOp { op, values } => {
            // `and`/`or` return the last operand evaluated, not a bare bool.
            // This matters for expressions like
            // `(d.get('key') or {}).get('nested')`.
            match op {
                BoolOp::And => {
                    let mut result = Value::Bool(true);
                    for value_expr in values {
                        result = eval(value_expr, ctx, helpers)?;
                        if !result.truthy() {
                            return Ok(result);
                        }
                    }
                    Ok(result)
                }
                BoolOp::Or => {
                    let mut result = Value::Bool(false);
                    for value_expr in values {
                        result = eval(value_expr, ctx, helpers)?;
                        if result.truthy() {
                            return Ok(result);
                        }
                    }
                    Ok(result)
                }
            }
        }
        Expr::Compare { left, rest } => {
            let mut left_value = eval(left, ctx, helpers)?;
            for (op, right_expr) in rest {
                let right_value = eval(right_expr, ctx, helpers)?;
                if !compare(*op, &left_value, &right_value)? {
                    return Ok(Value::Bool(false));
                }
                left_value = right_value;
            }
            Ok(Value::Bool(true))
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    let ordering_cmp = |check: fn(std::cmp::Ordering) -> bool| {
        left.loose_cmp(right)
            .map(check)
            .ok_or(EvalError::Comparison {
                left: left.type_name(),
                right: right.type_name(),
            })
    };

    match op {
        CmpOp::Eq => Ok(left.loose_eq(right)),
        CmpOp::NotEq => Ok(!left.loose_eq(right)),
        CmpOp::Lt => ordering_cmp(std::cmp::Ordering::is_lt),
        CmpOp::LtE => ordering_cmp(std::cmp::Ordering::is_le),
        CmpOp::Gt => ordering_cmp(std::cmp::Ordering::is_gt),
        CmpOp::GtE => ordering_cmp(std::cmp::Ordering::is_ge),
        // Identity narrows to equality in a value universe without object
        // identity; `is None` / `is not None` keep their usual meaning.
        CmpOp::Is => Ok(left.loose_eq(right)),
        CmpOp::IsNot => Ok(!left.loose_eq(right)),
        CmpOp::In => right.contains(left).ok_or(EvalError::Comparison {
            left: left.type_name(),
            right: right.type_name(),
        }),
        CmpOp::NotIn => right
            .contains(left)
            .map(|contained| !contained)
            .ok_or(EvalError::Comparison {
                left: left.type_name(),
                right: right.type_name(),
            }),
    }
}

fn subscript(object: &Value, key: &Value) -> Result<Value, EvalError> {
    match (object, key) {
        (Value::Map(map), Value::Str(k)) => map
            .get(k.as_str())
            .cloned()
            .ok_or_else(|| EvalError::Subscript(format!("key '{k}' not found"))),
        (Value::List(list), Value::Int(i)) => {
            let index = normalize_index(*i, list.len())
                .ok_or_else(|| EvalError::Subscript(format!("index {i} out of range")))?;
            Ok(list[index].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let index = normalize_index(*i, chars.len())
                .ok_or_else(|| EvalError::Subscript(format!("index {i} out of range")))?;
            Ok(Value::Str(chars[index].to_string()))
        }
        (object, key) => Err(EvalError::Subscript(format!(
            "cannot index {} with {}",
            object.type_name(),
            key.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Safe method calls: a closed set per receiver type.
fn call_method(object: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match object {
        Value::Map(map) => match method {
            "get" => {
                let key = str_arg(args.first(), "get")?;
                let default = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(map.get(key).cloned().unwrap_or(default))
            }
            "keys" => Ok(Value::List(
                map.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            "values" => Ok(Value::List(map.values().cloned().collect())),
            "items" => Ok(Value::List(
                map.iter()
                    .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
                    .collect(),
            )),
            _ => Err(EvalError::UnsupportedMethod {
                type_name: "dict",
                method: method.to_string(),
            }),
        },
        Value::Str(s) => match method {
            "strip" => Ok(Value::Str(s.trim().to_string())),
            "lstrip" => Ok(Value::Str(s.trim_start().to_string())),
            "rstrip" => Ok(Value::Str(s.trim_end().to_string())),
            "startswith" => Ok(Value::Bool(s.starts_with(str_arg(args.first(), method)?))),
            "endswith" => Ok(Value::Bool(s.ends_with(str_arg(args.first(), method)?))),
            "lower" => Ok(Value::Str(s.to_lowercase())),
            "upper" => Ok(Value::Str(s.to_uppercase())),
            "split" => {
                let parts: Vec<Value> = match args.first() {
                    Some(Value::Str(sep)) => {
                        s.split(sep.as_str()).map(Value::from).collect()
                    }
                    None => s.split_whitespace().map(Value::from).collect(),
                    Some(other) => {
                        return Err(EvalError::Helper(format!(
                            "split separator must be a string, got {}",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::List(parts))
            }
            _ => Err(EvalError::UnsupportedMethod {
                type_name: "str",
                method: method.to_string(),
            }),
        },
        Value::List(list) => match method {
            "count" => {
                let needle = args.first().ok_or_else(|| {
                    EvalError::Helper("count() requires an argument".into())
                })?;
                Ok(Value::Int(
                    list.iter().filter(|v| v.loose_eq(needle)).count() as i64,
                ))
            }
            "index" => {
                let needle = args.first().ok_or_else(|| {
                    EvalError::Helper("index() requires an argument".into())
                })?;
                list.iter()
                    .position(|v| v.loose_eq(needle))
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| EvalError::Helper("value not in list".into()))
            }
            _ => Err(EvalError::UnsupportedMethod {
                type_name: "list",
                method: method.to_string(),
            }),
        },
        other => Err(EvalError::UnsupportedMethod {
            type_name: other.type_name(),
            method: method.to_string(),
        }),
    }
}

fn str_arg<'a>(arg: Option<&'a Value>, method: &str) -> Result<&'a str, EvalError> {
    match arg {
        Some(Value::Str(s)) => Ok(s.as_str()),
        Some(other) => Err(EvalError::Helper(format!(
            "{method}() expects a string argument, got {}",
            other.type_name()
        ))),
        None => Err(EvalError::Helper(format!("{method}() requires an argument"))),
    }
}

// ── Condition evaluator ─────────────────────────────────────────────────

/// Evaluates `when` conditions in workflows.
///
/// An empty condition is vacuously true. Any parse or evaluation failure
/// yields `false` and a warning log: evaluators run inside trigger loops
/// and must never take the daemon down.
#[derive(Default, Clone)]
pub struct ConditionEvaluator {
    plugin_conditions: HelperTable,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin-provided condition callable.
    pub fn register_condition(&mut self, name: impl Into<String>, func: HelperFn) {
        self.plugin_conditions.insert(name, func);
    }

    pub fn plugin_conditions(&self) -> &HelperTable {
        &self.plugin_conditions
    }

    /// Evaluate a condition against a JSON context map with the given
    /// helper table (plugin conditions are merged in).
    pub fn evaluate_with_helpers(
        &self,
        condition: &str,
        ctx: &serde_json::Map<String, serde_json::Value>,
        helpers: &HelperTable,
    ) -> bool {
        if condition.trim().is_empty() {
            return true;
        }

        let mut table = helpers.clone();
        table.merge(&self.plugin_conditions);

        let context: BTreeMap<String, Value> = ctx
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect();

        match self.try_evaluate(condition, &context, &table) {
            Ok(result) => result,
            Err(e) => {
                warn!(condition, error = %e, "condition evaluation failed");
                false
            }
        }
    }

    /// Evaluate a condition with the generic helper table only.
    pub fn evaluate(
        &self,
        condition: &str,
        ctx: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        self.evaluate_with_helpers(condition, ctx, &crate::expr::helpers::generic_helpers())
    }

    fn try_evaluate(
        &self,
        condition: &str,
        ctx: &BTreeMap<String, Value>,
        helpers: &HelperTable,
    ) -> Result<bool, EvalError> {
        let parsed = ast::parse(condition)?;
        Ok(eval(&parsed, ctx, helpers)?.truthy())
    }
}

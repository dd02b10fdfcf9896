//! Value model for the safe expression evaluator.
//!
//! Conditions operate on a small dynamic value universe with loose,
//! scripting-style semantics: empty collections and strings are falsy,
//! numbers compare across int/float, and `and`/`or` return operands rather
//! than bare booleans. `Lazy` wraps an expensive predicate that is computed
//! at most once, on first boolean coercion, so short-circuiting skips it.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// A boolean whose computation is deferred until first coercion.
pub struct LazyBool {
    cell: OnceLock<bool>,
    thunk: Box<dyn Fn() -> bool + Send + Sync>,
}

impl LazyBool {
    pub fn new(thunk: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            thunk: Box::new(thunk),
        }
    }

    /// Force the value, memoizing the result.
    pub fn get(&self) -> bool {
        *self.cell.get_or_init(|| (self.thunk)())
    }

    /// Whether the thunk has run.
    pub fn computed(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl std::fmt::Debug for LazyBool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cell.get() {
            Some(v) => write!(f, "LazyBool({v})"),
            None => write!(f, "LazyBool(<not computed>)"),
        }
    }
}

/// A value in the expression universe.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Lazy(Arc<LazyBool>),
}

impl Value {
    /// Scripting-style truthiness: empty strings/collections and zero are
    /// falsy. Coercing a `Lazy` forces its thunk.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Lazy(lazy) => lazy.get(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Loose equality: numbers compare across int/float, booleans compare
    /// with ints the way dynamic languages treat them, collections compare
    /// element-wise. Lazy values are forced.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Lazy(a), b) => Value::Bool(a.get()).loose_eq(b),
            (a, Value::Lazy(b)) => a.loose_eq(&Value::Bool(b.get())),
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => {
                (*a as i64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.loose_eq(other)))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`: numbers and strings only.
    pub fn loose_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Membership test for `in`: list element, substring, or map key.
    pub fn contains(&self, item: &Value) -> Option<bool> {
        match self {
            Value::List(list) => Some(list.iter().any(|v| v.loose_eq(item))),
            Value::Str(s) => match item {
                Value::Str(needle) => Some(s.contains(needle.as_str())),
                _ => None,
            },
            Value::Map(map) => match item {
                Value::Str(key) => Some(map.contains_key(key.as_str())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Lazy(_) => "bool",
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::from(&value)
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Lazy(lazy) => serde_json::Value::Bool(lazy.get()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

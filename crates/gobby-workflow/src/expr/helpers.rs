//! Allow-listed function tables for condition evaluation.
//!
//! The table is built at the call site: generic conversions are always
//! present, task/stop helpers close over collaborator handles when they are
//! available (and return safe defaults when they are not), and the MCP
//! helpers close over the evaluation context's `variables.mcp_calls` /
//! `variables.mcp_results` tables.

use std::sync::Arc;

use gobby_types::{StopRegistry, TaskConditions};
use serde_json::Value as JsonValue;

use crate::expr::eval::{EvalError, HelperFn, HelperTable};
use crate::expr::value::Value;

fn arg_string(args: &[Value], index: usize, func: &str) -> Result<String, EvalError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(other) => Err(EvalError::Helper(format!(
            "{func}() argument {index} must be a string, got {}",
            other.type_name()
        ))),
        None => Err(EvalError::Helper(format!(
            "{func}() missing argument {index}"
        ))),
    }
}

/// The generic conversion helpers: `len`, `bool`, `str`, `int`, `list`,
/// `dict`.
pub fn generic_helpers() -> HelperTable {
    let mut table = HelperTable::new();

    table.insert(
        "len",
        Arc::new(|args: &[Value]| match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::List(l)) => Ok(Value::Int(l.len() as i64)),
            Some(Value::Map(m)) => Ok(Value::Int(m.len() as i64)),
            Some(other) => Err(EvalError::Helper(format!(
                "len() unsupported for {}",
                other.type_name()
            ))),
            None => Err(EvalError::Helper("len() requires an argument".into())),
        }) as HelperFn,
    );

    table.insert(
        "bool",
        Arc::new(|args: &[Value]| {
            Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
        }) as HelperFn,
    );

    table.insert(
        "str",
        Arc::new(|args: &[Value]| {
            let rendered = match args.first() {
                None => String::new(),
                Some(Value::Str(s)) => s.clone(),
                Some(Value::Null) => "None".to_string(),
                Some(Value::Bool(b)) => if *b { "True" } else { "False" }.to_string(),
                Some(Value::Int(i)) => i.to_string(),
                Some(Value::Float(f)) => f.to_string(),
                Some(other) => serde_json::Value::from(other).to_string(),
            };
            Ok(Value::Str(rendered))
        }) as HelperFn,
    );

    table.insert(
        "int",
        Arc::new(|args: &[Value]| match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(*i)),
            Some(Value::Float(f)) => Ok(Value::Int(*f as i64)),
            Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| EvalError::Helper(format!("int('{s}') failed: {e}"))),
            other => Err(EvalError::Helper(format!(
                "int() unsupported for {:?}",
                other.map(Value::type_name)
            ))),
        }) as HelperFn,
    );

    table.insert(
        "list",
        Arc::new(|args: &[Value]| match args.first() {
            None => Ok(Value::List(Vec::new())),
            Some(Value::List(l)) => Ok(Value::List(l.clone())),
            Some(Value::Str(s)) => Ok(Value::List(
                s.chars().map(|c| Value::Str(c.to_string())).collect(),
            )),
            Some(Value::Map(m)) => Ok(Value::List(
                m.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            Some(other) => Err(EvalError::Helper(format!(
                "list() unsupported for {}",
                other.type_name()
            ))),
        }) as HelperFn,
    );

    table.insert(
        "dict",
        Arc::new(|args: &[Value]| match args.first() {
            None => Ok(Value::Map(Default::default())),
            Some(Value::Map(m)) => Ok(Value::Map(m.clone())),
            Some(other) => Err(EvalError::Helper(format!(
                "dict() unsupported for {}",
                other.type_name()
            ))),
        }) as HelperFn,
    );

    table
}

/// Options for [`build_condition_helpers`].
#[derive(Default, Clone)]
pub struct HelperSources {
    pub task_conditions: Option<Arc<dyn TaskConditions>>,
    pub stop_registry: Option<Arc<dyn StopRegistry>>,
}

/// Build the full helper table for a condition evaluation.
///
/// `ctx_variables` is the evaluation context's `variables` map; the MCP
/// helpers read `mcp_calls` / `mcp_results` out of it.
pub fn build_condition_helpers(
    sources: &HelperSources,
    ctx_variables: &serde_json::Map<String, JsonValue>,
) -> HelperTable {
    let mut table = generic_helpers();

    // ── Task helpers ──
    match sources.task_conditions.clone() {
        Some(tasks) => {
            let complete = tasks.clone();
            table.insert(
                "task_tree_complete",
                Arc::new(move |args: &[Value]| {
                    let task_id = arg_string(args, 0, "task_tree_complete")?;
                    Ok(Value::Bool(complete.task_tree_complete(&task_id)))
                }) as HelperFn,
            );
            table.insert(
                "task_needs_user_review",
                Arc::new(move |args: &[Value]| {
                    let task_id = arg_string(args, 0, "task_needs_user_review")?;
                    Ok(Value::Bool(tasks.task_needs_user_review(&task_id)))
                }) as HelperFn,
            );
        }
        None => {
            // Safe defaults when no task store is wired up.
            table.insert(
                "task_tree_complete",
                Arc::new(|_: &[Value]| Ok(Value::Bool(true))) as HelperFn,
            );
            table.insert(
                "task_needs_user_review",
                Arc::new(|_: &[Value]| Ok(Value::Bool(false))) as HelperFn,
            );
        }
    }

    // ── Stop signal helper ──
    match sources.stop_registry.clone() {
        Some(registry) => {
            table.insert(
                "has_stop_signal",
                Arc::new(move |args: &[Value]| {
                    let session_id = arg_string(args, 0, "has_stop_signal")?;
                    Ok(Value::Bool(registry.has_pending_signal(&session_id)))
                }) as HelperFn,
            );
        }
        None => {
            table.insert(
                "has_stop_signal",
                Arc::new(|_: &[Value]| Ok(Value::Bool(false))) as HelperFn,
            );
        }
    }

    // ── MCP call tracking helpers ──
    let mcp_calls = ctx_variables.get("mcp_calls").cloned().unwrap_or(JsonValue::Null);
    let mcp_results = ctx_variables
        .get("mcp_results")
        .cloned()
        .unwrap_or(JsonValue::Null);

    {
        let calls = mcp_calls.clone();
        table.insert(
            "mcp_called",
            Arc::new(move |args: &[Value]| {
                let server = arg_string(args, 0, "mcp_called")?;
                let Some(server_calls) = calls.get(&server) else {
                    return Ok(Value::Bool(false));
                };
                match args.get(1) {
                    Some(Value::Str(tool)) => Ok(Value::Bool(
                        server_calls
                            .as_array()
                            .is_some_and(|list| list.iter().any(|v| v.as_str() == Some(tool))),
                    )),
                    _ => Ok(Value::Bool(
                        server_calls.as_array().is_some_and(|list| !list.is_empty()),
                    )),
                }
            }) as HelperFn,
        );
    }

    {
        let results = mcp_results.clone();
        table.insert(
            "mcp_result_is_null",
            Arc::new(move |args: &[Value]| {
                let server = arg_string(args, 0, "mcp_result_is_null")?;
                let tool = arg_string(args, 1, "mcp_result_is_null")?;
                let result = results.get(&server).and_then(|s| s.get(&tool));
                Ok(Value::Bool(matches!(result, None | Some(JsonValue::Null))))
            }) as HelperFn,
        );
    }

    {
        let results = mcp_results.clone();
        table.insert(
            "mcp_failed",
            Arc::new(move |args: &[Value]| {
                let server = arg_string(args, 0, "mcp_failed")?;
                let tool = arg_string(args, 1, "mcp_failed")?;
                let Some(result) = results.get(&server).and_then(|s| s.get(&tool)) else {
                    return Ok(Value::Bool(false));
                };
                let failed = result.get("success").and_then(JsonValue::as_bool) == Some(false)
                    || result.get("error").is_some_and(|e| !e.is_null())
                    || result.get("status").and_then(JsonValue::as_str) == Some("failed");
                Ok(Value::Bool(failed))
            }) as HelperFn,
        );
    }

    {
        let results = mcp_results;
        table.insert(
            "mcp_result_has",
            Arc::new(move |args: &[Value]| {
                let server = arg_string(args, 0, "mcp_result_has")?;
                let tool = arg_string(args, 1, "mcp_result_has")?;
                let field = arg_string(args, 2, "mcp_result_has")?;
                let expected = args.get(3).cloned().unwrap_or(Value::Null);
                let Some(actual) = results
                    .get(&server)
                    .and_then(|s| s.get(&tool))
                    .and_then(|r| r.get(&field))
                else {
                    return Ok(Value::Bool(false));
                };
                Ok(Value::Bool(Value::from(actual).loose_eq(&expected)))
            }) as HelperFn,
        );
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::eval::ConditionEvaluator;
    use serde_json::json;

    struct StubTasks;

    impl TaskConditions for StubTasks {
        fn task_tree_complete(&self, task_id: &str) -> bool {
            task_id == "done-task"
        }
        fn task_needs_user_review(&self, _task_id: &str) -> bool {
            true
        }
    }

    struct StubStop;

    impl StopRegistry for StubStop {
        fn has_pending_signal(&self, session_id: &str) -> bool {
            session_id == "stopping"
        }
    }

    fn evaluate(expr: &str, variables: serde_json::Value, sources: &HelperSources) -> bool {
        let ctx = variables.as_object().unwrap().clone();
        let helpers = build_condition_helpers(sources, &ctx);
        ConditionEvaluator::new().evaluate_with_helpers(expr, &ctx, &helpers)
    }

    #[test]
    fn test_task_helpers_with_store() {
        let sources = HelperSources {
            task_conditions: Some(Arc::new(StubTasks)),
            stop_registry: None,
        };
        assert!(evaluate("task_tree_complete('done-task')", json!({}), &sources));
        assert!(!evaluate("task_tree_complete('open-task')", json!({}), &sources));
        assert!(evaluate("task_needs_user_review('any')", json!({}), &sources));
    }

    #[test]
    fn test_task_helpers_safe_defaults() {
        let sources = HelperSources::default();
        assert!(evaluate("task_tree_complete('whatever')", json!({}), &sources));
        assert!(!evaluate("task_needs_user_review('whatever')", json!({}), &sources));
    }

    #[test]
    fn test_stop_signal_helper() {
        let sources = HelperSources {
            task_conditions: None,
            stop_registry: Some(Arc::new(StubStop)),
        };
        assert!(evaluate("has_stop_signal('stopping')", json!({}), &sources));
        assert!(!evaluate("has_stop_signal('running')", json!({}), &sources));
        assert!(!evaluate("has_stop_signal('x')", json!({}), &HelperSources::default()));
    }

    #[test]
    fn test_mcp_called() {
        let variables = json!({
            "mcp_calls": {"gobby-memory": ["recall", "remember"]}
        });
        let sources = HelperSources::default();
        assert!(evaluate("mcp_called('gobby-memory')", variables.clone(), &sources));
        assert!(evaluate("mcp_called('gobby-memory', 'recall')", variables.clone(), &sources));
        assert!(!evaluate("mcp_called('gobby-memory', 'forget')", variables.clone(), &sources));
        assert!(!evaluate("mcp_called('context7')", variables, &sources));
    }

    #[test]
    fn test_mcp_result_checks() {
        let variables = json!({
            "mcp_results": {
                "gobby-tasks": {
                    "claim_task": {"status": "ok", "id": "t1"},
                    "broken": {"error": "boom"},
                    "empty": null
                }
            }
        });
        let sources = HelperSources::default();
        assert!(evaluate("mcp_result_is_null('gobby-tasks', 'empty')", variables.clone(), &sources));
        assert!(evaluate("mcp_result_is_null('gobby-tasks', 'missing')", variables.clone(), &sources));
        assert!(!evaluate(
            "mcp_result_is_null('gobby-tasks', 'claim_task')",
            variables.clone(),
            &sources
        ));
        assert!(evaluate("mcp_failed('gobby-tasks', 'broken')", variables.clone(), &sources));
        assert!(!evaluate("mcp_failed('gobby-tasks', 'claim_task')", variables.clone(), &sources));
        assert!(evaluate(
            "mcp_result_has('gobby-tasks', 'claim_task', 'id', 't1')",
            variables.clone(),
            &sources
        ));
        assert!(!evaluate(
            "mcp_result_has('gobby-tasks', 'claim_task', 'id', 'other')",
            variables,
            &sources
        ));
    }
}

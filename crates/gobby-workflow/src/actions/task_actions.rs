//! Task, TODO-file, MCP proxy, and session-chaining actions.

use serde_json::Value;
use tracing::{info, warn};

use gobby_types::NewTask;

use super::{ActionContext, ActionDef, ActionError, ActionOutput, ActionResult, arg_str};

const DEFAULT_TODO_FILE: &str = "TODO.md";

fn todo_path(ctx: &ActionContext, args: &ActionDef) -> std::path::PathBuf {
    let filename = arg_str(args, "filename").unwrap_or(DEFAULT_TODO_FILE);
    match &ctx.project_path {
        Some(project) => project.join(filename),
        None => std::path::PathBuf::from(filename),
    }
}

/// `write_todos`: write (or append) a checklist to the project TODO file.
pub(super) async fn write_todos(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let todos: Vec<String> = args
        .get("todos")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let path = todo_path(ctx, args);
    let formatted: Vec<String> = todos.iter().map(|todo| format!("- [ ] {todo}")).collect();

    let append = arg_str(args, "mode") == Some("append") && path.exists();
    let outcome = if append {
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        std::fs::write(&path, format!("{existing}\n{}\n", formatted.join("\n")))
    } else {
        std::fs::write(&path, format!("# TODOs\n\n{}\n", formatted.join("\n")))
    };
    outcome.map_err(|e| ActionError::new(format!("write_todos failed: {e}")))?;

    Ok(ActionOutput::vars([
        ("todos_written".to_string(), Value::from(todos.len() as i64)),
        (
            "file".to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        ),
    ]))
}

/// `mark_todo_complete`: flip a `- [ ]` entry to `- [x]` in the TODO file.
pub(super) async fn mark_todo_complete(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(todo_text) = arg_str(args, "todo_text") else {
        return Err(ActionError::new("missing todo_text"));
    };
    let path = todo_path(ctx, args);
    if !path.exists() {
        return Err(ActionError::new("file not found"));
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| ActionError::new(format!("failed to read {}: {e}", path.display())))?;

    let mut updated = false;
    let rewritten: Vec<String> = content
        .lines()
        .map(|line| {
            if !updated && line.contains(todo_text) && line.contains("- [ ]") {
                updated = true;
                line.replacen("- [ ]", "- [x]", 1)
            } else {
                line.to_string()
            }
        })
        .collect();

    if updated {
        std::fs::write(&path, rewritten.join("\n") + "\n")
            .map_err(|e| ActionError::new(format!("failed to write {}: {e}", path.display())))?;
    }

    Ok(ActionOutput::var("todo_completed", Value::Bool(updated)))
}

/// `persist_tasks`: bulk-create tasks from a list of dicts.
pub(super) async fn persist_tasks(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let tasks_store = ctx
        .services
        .tasks
        .as_ref()
        .ok_or_else(|| ActionError::new("task store not available"))?;

    let project_id = ctx
        .session()
        .await
        .and_then(|session| session.project_id)
        .unwrap_or_else(|| "default".to_string());

    let entries: Vec<&serde_json::Map<String, Value>> = args
        .get("tasks")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();

    let mut ids = Vec::new();
    for entry in entries {
        let Some(title) = entry.get("title").and_then(Value::as_str) else {
            continue;
        };
        let new_task = NewTask {
            project_id: project_id.clone(),
            title: title.to_string(),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            priority: entry.get("priority").and_then(Value::as_i64).unwrap_or(2),
            task_type: entry
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("task")
                .to_string(),
            labels: entry
                .get("labels")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            discovered_in_session_id: Some(ctx.session_id.clone()),
        };
        match tasks_store.create_task(new_task).await {
            Ok(task) => ids.push(Value::String(task.id)),
            Err(e) => warn!(error = %e, "persist_tasks: failed to create task"),
        }
    }

    Ok(ActionOutput::vars([
        ("tasks_persisted".to_string(), Value::from(ids.len() as i64)),
        ("ids".to_string(), Value::Array(ids)),
    ]))
}

/// `call_mcp_tool`: proxy a call to a connected MCP server, optionally
/// binding the result to a variable.
pub(super) async fn call_mcp_tool(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let (Some(server_name), Some(tool_name)) =
        (arg_str(args, "server_name"), arg_str(args, "tool_name"))
    else {
        return Err(ActionError::new("missing server_name or tool_name"));
    };
    let proxy = ctx
        .services
        .tool_proxy
        .as_ref()
        .ok_or_else(|| ActionError::new("MCP manager not available"))?;

    if !proxy.is_connected(server_name) {
        return Err(ActionError::new(format!("Server {server_name} not connected")));
    }

    let arguments = args
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let result = proxy
        .call_tool(server_name, tool_name, arguments)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    if let Some(output_as) = arg_str(args, "as") {
        ctx.set_variable(output_as, result.clone());
    }

    Ok(ActionOutput::vars([
        ("result".to_string(), result),
        (
            "stored_as".to_string(),
            arg_str(args, "as").map(|s| Value::String(s.into())).unwrap_or(Value::Null),
        ),
    ]))
}

/// `mark_session_status`: update the current or parent session's status.
pub(super) async fn mark_session_status(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(status) = arg_str(args, "status") else {
        return Err(ActionError::new("missing status"));
    };
    let sessions = ctx
        .services
        .sessions
        .as_ref()
        .ok_or_else(|| ActionError::new("session store not available"))?;

    let target_id = if arg_str(args, "target") == Some("parent_session") {
        ctx.session()
            .await
            .and_then(|session| session.parent_session_id)
            .ok_or_else(|| ActionError::new("no parent session linked"))?
    } else {
        ctx.session_id.clone()
    };

    sessions
        .update_status(&target_id, status)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    Ok(ActionOutput::vars([
        ("status_updated".to_string(), Value::Bool(true)),
        ("session_id".to_string(), Value::String(target_id)),
        ("status".to_string(), Value::String(status.into())),
    ]))
}

/// `start_new_session`: spawn a detached assistant process, optionally with
/// an initial prompt.
pub(super) async fn start_new_session(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let session = ctx.session().await;

    let command = match arg_str(args, "command") {
        Some(command) => command.to_string(),
        None => session
            .as_ref()
            .and_then(|s| s.source.clone())
            .unwrap_or_else(|| "claude".to_string()),
    };

    let mut cmd_args: Vec<String> = match args.get("args") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(raw)) => raw.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    };

    if let Some(prompt) = arg_str(args, "prompt") {
        if matches!(command.as_str(), "claude" | "gemini") {
            cmd_args.push("-p".to_string());
            cmd_args.push(prompt.to_string());
        }
    }

    let cwd = arg_str(args, "cwd")
        .map(std::path::PathBuf::from)
        .or_else(|| ctx.project_path.clone())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    info!(%command, ?cmd_args, cwd = %cwd.display(), "starting new session");

    let child = tokio::process::Command::new(&command)
        .args(&cmd_args)
        .current_dir(&cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ActionError::new(format!("failed to start new session: {e}")))?;

    Ok(ActionOutput::vars([
        ("started_new_session".to_string(), Value::Bool(true)),
        (
            "pid".to_string(),
            child.id().map(|pid| Value::from(pid as i64)).unwrap_or(Value::Null),
        ),
        ("command".to_string(), Value::String(command)),
    ]))
}

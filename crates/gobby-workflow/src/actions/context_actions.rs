//! Context and state manipulation actions.

use serde_json::{Map, Value};
use tracing::warn;

use super::{ActionContext, ActionDef, ActionError, ActionOutput, ActionResult, arg_str};

/// Key under which captured artifacts live in the state variables.
const ARTIFACTS_VAR: &str = "artifacts";

/// `inject_context`: pull content from a named source, optionally render it
/// through a template, and return it as injected context.
pub(super) async fn inject_context(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(source) = arg_str(args, "source") else {
        return Ok(ActionOutput::Empty);
    };

    let mut content = String::new();

    match source {
        "previous_session_summary" | "handoff" => {
            let Some(session) = ctx.session().await else {
                warn!(session_id = %ctx.session_id, "session not found");
                return Ok(ActionOutput::Empty);
            };
            if let Some(parent_id) = &session.parent_session_id {
                if let Some(sessions) = &ctx.services.sessions {
                    if let Some(parent) = sessions.get(parent_id).await {
                        content = parent.summary_markdown.unwrap_or_default();
                    }
                }
            }
        }
        "artifacts" => {
            let variables = ctx.variables();
            if let Some(artifacts) = variables.get(ARTIFACTS_VAR).and_then(Value::as_object) {
                if !artifacts.is_empty() {
                    let mut lines = vec!["## Captured Artifacts".to_string()];
                    for (name, path) in artifacts {
                        lines.push(format!("- {name}: {}", path.as_str().unwrap_or_default()));
                    }
                    content = lines.join("\n");
                }
            }
        }
        "observations" => {
            let observations = ctx.state.lock().observations.clone();
            if !observations.is_empty() {
                content = format!(
                    "## Observations\n{}",
                    serde_json::to_string_pretty(&observations).unwrap_or_default()
                );
            }
        }
        "workflow_state" => {
            let state = ctx.state.lock().clone();
            let mut dump = serde_json::to_value(&state).unwrap_or(Value::Null);
            if let Some(map) = dump.as_object_mut() {
                map.remove("observations");
            }
            content = format!(
                "## Workflow State\n{}",
                serde_json::to_string_pretty(&dump).unwrap_or_default()
            );
        }
        "compact_handoff" => {
            if let Some(session) = ctx.session().await {
                content = session.compact_markdown.unwrap_or_default();
            }
        }
        other => {
            warn!(source = other, "unknown inject_context source");
        }
    }

    if content.is_empty() {
        return Ok(ActionOutput::Empty);
    }

    if let Some(template) = arg_str(args, "template") {
        let mut render_ctx = ctx.render_context().await;
        match source {
            "previous_session_summary" | "handoff" => {
                render_ctx.insert("summary".into(), Value::String(content.clone()));
                let mut handoff = Map::new();
                handoff.insert("notes".into(), Value::String(content.clone()));
                render_ctx.insert("handoff".into(), Value::Object(handoff));
            }
            "artifacts" => {
                render_ctx.insert("artifacts_list".into(), Value::String(content.clone()));
            }
            "observations" => {
                render_ctx.insert("observations_text".into(), Value::String(content.clone()));
            }
            "workflow_state" => {
                render_ctx.insert("workflow_state_text".into(), Value::String(content.clone()));
            }
            _ => {}
        }
        content = ctx.template.render(template, &render_ctx)?;
    }

    ctx.state.lock().context_injected = true;
    Ok(ActionOutput::Inject(content))
}

/// `inject_message`: render a template with the full state context and
/// return it as a user/assistant-visible message.
pub(super) async fn inject_message(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(content) = arg_str(args, "content") else {
        return Ok(ActionOutput::Empty);
    };

    let mut render_ctx = ctx.render_context().await;
    for (key, value) in args {
        render_ctx.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let rendered = ctx.template.render(content, &render_ctx)?;
    Ok(ActionOutput::Message(rendered))
}

/// `capture_artifact`: resolve a glob and store the first match under the
/// given artifact name.
pub(super) async fn capture_artifact(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(pattern) = arg_str(args, "pattern") else {
        return Ok(ActionOutput::Empty);
    };

    let matches = glob::glob(pattern)
        .map_err(|e| ActionError::new(format!("invalid glob '{pattern}': {e}")))?;
    let Some(first) = matches.flatten().next() else {
        return Ok(ActionOutput::Empty);
    };
    let resolved = std::fs::canonicalize(&first).unwrap_or(first);
    let resolved_str = resolved.to_string_lossy().to_string();

    if let Some(save_as) = arg_str(args, "as") {
        let mut state = ctx.state.lock();
        let artifacts = state
            .variables
            .entry(ARTIFACTS_VAR.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = artifacts.as_object_mut() {
            map.insert(save_as.to_string(), Value::String(resolved_str.clone()));
        }
    }

    Ok(ActionOutput::var("captured", Value::String(resolved_str)))
}

/// `read_artifact`: read file contents (by artifact key or glob) into a
/// workflow variable.
pub(super) async fn read_artifact(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(pattern) = arg_str(args, "pattern") else {
        return Ok(ActionOutput::Empty);
    };
    let Some(variable_name) = arg_str(args, "as") else {
        warn!("read_artifact: 'as' argument missing");
        return Ok(ActionOutput::Empty);
    };

    // An existing artifact key wins over glob interpretation.
    let artifact_path = ctx
        .variables()
        .get(ARTIFACTS_VAR)
        .and_then(Value::as_object)
        .and_then(|artifacts| artifacts.get(pattern))
        .and_then(Value::as_str)
        .map(std::path::PathBuf::from);

    let path = match artifact_path {
        Some(path) => Some(path),
        None => glob::glob(pattern)
            .map_err(|e| ActionError::new(format!("invalid glob '{pattern}': {e}")))?
            .flatten()
            .next(),
    };

    let Some(path) = path.filter(|p| p.exists()) else {
        warn!(pattern, "read_artifact: file not found");
        return Ok(ActionOutput::Empty);
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| ActionError::new(format!("failed to read {}: {e}", path.display())))?;
    let length = content.len();
    ctx.set_variable(variable_name, Value::String(content));

    Ok(ActionOutput::vars([
        ("read_artifact".to_string(), Value::Bool(true)),
        ("variable".to_string(), Value::String(variable_name.into())),
        ("length".to_string(), Value::from(length as i64)),
    ]))
}

/// `load_workflow_state`: force a reload of the persisted row into the
/// shared state.
pub(super) async fn load_workflow_state(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(manager) = &ctx.state_manager else {
        return Err(ActionError::new("state manager not available"));
    };
    match manager.get_state(&ctx.session_id) {
        Ok(Some(loaded)) => {
            *ctx.state.lock() = loaded;
            Ok(ActionOutput::var("state_loaded", Value::Bool(true)))
        }
        Ok(None) => Ok(ActionOutput::var("state_loaded", Value::Bool(false))),
        Err(e) => Err(ActionError::new(e.to_string())),
    }
}

/// `save_workflow_state`: force a save of the shared state.
pub(super) async fn save_workflow_state(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(manager) = &ctx.state_manager else {
        return Err(ActionError::new("state manager not available"));
    };
    let state = ctx.state.lock().clone();
    manager
        .save_state(&state)
        .map_err(|e| ActionError::new(e.to_string()))?;
    Ok(ActionOutput::var("state_saved", Value::Bool(true)))
}

/// `set_variable`: assign a workflow variable.
pub(super) async fn set_variable(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(name) = arg_str(args, "name") else {
        return Ok(ActionOutput::Empty);
    };
    let value = args.get("value").cloned().unwrap_or(Value::Null);
    ctx.set_variable(name, value.clone());
    Ok(ActionOutput::vars([
        ("variable_set".to_string(), Value::String(name.into())),
        (name.to_string(), value),
    ]))
}

/// `increment_variable`: add to a numeric workflow variable.
pub(super) async fn increment_variable(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(name) = arg_str(args, "name") else {
        return Ok(ActionOutput::Empty);
    };
    let amount = args.get("amount").and_then(Value::as_i64).unwrap_or(1);

    let new_value = {
        let mut state = ctx.state.lock();
        let current = state
            .variables
            .get(name)
            .and_then(Value::as_i64)
            .unwrap_or_else(|| {
                if state.variables.contains_key(name) {
                    warn!(variable = name, "increment_variable: not numeric, resetting to 0");
                }
                0
            });
        let next = current + amount;
        state.variables.insert(name.to_string(), Value::from(next));
        next
    };

    Ok(ActionOutput::var(name, Value::from(new_value)))
}

/// `restore_context`: pull the parent session summary, optionally through a
/// template.
pub(super) async fn restore_context(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(session) = ctx.session().await else {
        return Ok(ActionOutput::Empty);
    };
    let Some(parent_id) = &session.parent_session_id else {
        return Ok(ActionOutput::Empty);
    };
    let Some(sessions) = &ctx.services.sessions else {
        return Ok(ActionOutput::Empty);
    };
    let Some(summary) = sessions
        .get(parent_id)
        .await
        .and_then(|parent| parent.summary_markdown)
    else {
        return Ok(ActionOutput::Empty);
    };

    let content = match arg_str(args, "template") {
        Some(template) => {
            let mut render_ctx = ctx.render_context().await;
            render_ctx.insert("summary".into(), Value::String(summary.clone()));
            ctx.template.render(template, &render_ctx)?
        }
        None => summary,
    };

    Ok(ActionOutput::Inject(content))
}

/// `switch_mode`: signal the agent to switch modes via a strong system
/// instruction.
pub(super) async fn switch_mode(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let _ = ctx;
    let Some(mode) = arg_str(args, "mode") else {
        return Err(ActionError::new("missing mode"));
    };
    let mode_upper = mode.to_uppercase();
    let message = format!(
        "SYSTEM: SWITCH MODE TO {mode_upper}\nYou are now in {mode_upper} mode. Adjust your behavior accordingly."
    );
    Ok(ActionOutput::Multi(vec![
        ActionOutput::Inject(message),
        ActionOutput::var("mode_switch", Value::String(mode.into())),
    ]))
}

/// `mark_loop_complete`: record that the autonomous loop finished.
pub(super) async fn mark_loop_complete(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    ctx.set_variable("stop_reason", Value::String("completed".into()));
    Ok(ActionOutput::var("stop_reason", Value::String("completed".into())))
}

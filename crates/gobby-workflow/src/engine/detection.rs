//! Detection helpers: built-in observers implemented in native code.
//!
//! These watch AFTER_TOOL / BEFORE_AGENT events and maintain the
//! `task_claimed`, `plan_mode`, and MCP call-tracking variables that rules
//! and transition conditions lean on. All mutations go through the state's
//! variables map; the engine persists the diff through the atomic merge.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use gobby_storage::WorkflowState;
use gobby_types::{HookEvent, TaskStore};

use crate::definitions::ActionDef;
use crate::template::TemplateEngine;

const TASK_SERVER: &str = "gobby-tasks";

/// Whether a normalized MCP tool output looks like a failure.
fn output_is_error(tool_output: &Value) -> bool {
    let Some(output) = tool_output.as_object() else {
        return false;
    };
    if output.get("error").is_some_and(|e| !e.is_null()) {
        return true;
    }
    if output.get("status").and_then(Value::as_str) == Some("error") {
        return true;
    }
    if let Some(result) = output.get("result").and_then(Value::as_object) {
        if result.get("error").is_some_and(|e| !e.is_null()) {
            return true;
        }
    }
    false
}

/// Detect gobby-tasks calls that claim or release a task for this session.
///
/// `create_task`, `claim_task`, and `update_task` with `status: in_progress`
/// set `task_claimed` / `claimed_task_id`; a successful `close_task` clears
/// them. Claimed ids are resolved to UUIDs through the task store because
/// `#123`-style refs break later comparisons.
pub(crate) async fn detect_task_claim(
    event: &HookEvent,
    state: &mut WorkflowState,
    tasks: Option<&std::sync::Arc<dyn TaskStore>>,
) {
    if event.mcp_server() != Some(TASK_SERVER) {
        return;
    }
    let Some(tool) = event.mcp_tool() else {
        return;
    };

    let tool_input = event.tool_input().cloned().unwrap_or_default();
    let tool_output = event.tool_output().cloned().unwrap_or(Value::Null);
    let arguments = tool_input
        .get("arguments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if tool == "close_task" {
        // Without tool output we cannot verify success; the MCP proxy
        // handles state clearing for transports that omit tool results.
        if tool_output.is_null() {
            return;
        }
        if output_is_error(&tool_output) {
            return;
        }
        state.variables.insert("task_claimed".into(), Value::Bool(false));
        state.variables.insert("claimed_task_id".into(), Value::Null);
        info!(session_id = %state.session_id, "task_claimed=false (close_task succeeded)");
        return;
    }

    if !matches!(tool, "create_task" | "update_task" | "claim_task") {
        return;
    }
    if tool == "update_task"
        && arguments.get("status").and_then(Value::as_str) != Some("in_progress")
    {
        return;
    }
    if output_is_error(&tool_output) {
        return;
    }

    // Resolve the claimed task to a UUID.
    let task_id: Option<String> = match tool {
        "update_task" | "claim_task" => {
            let raw = arguments.get("task_id").and_then(Value::as_str);
            match (raw, tasks) {
                (Some(raw_id), Some(store)) => match store.get_task(raw_id).await {
                    Some(task) => Some(task.id),
                    None => {
                        warn!(task_ref = raw_id, "cannot resolve task ref to UUID");
                        None
                    }
                },
                (Some(raw_id), None) => {
                    warn!(task_ref = raw_id, "cannot resolve task ref: no task store");
                    None
                }
                _ => None,
            }
        }
        "create_task" => tool_output
            .get("result")
            .and_then(|result| result.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };

    let Some(task_id) = task_id else {
        debug!(tool, "skipping task claim update, no valid task id");
        return;
    };

    state.variables.insert("task_claimed".into(), Value::Bool(true));
    state
        .variables
        .insert("claimed_task_id".into(), Value::String(task_id.clone()));
    info!(
        session_id = %state.session_id,
        claimed_task_id = %task_id,
        via = tool,
        "task claimed"
    );

    // Claiming links the task to the session.
    if matches!(tool, "update_task" | "claim_task") {
        if let Some(store) = tasks {
            if let Err(e) = store.link_task(&state.session_id, &task_id, "worked_on").await {
                warn!(task_id = %task_id, error = %e, "failed to auto-link task");
            }
        }
    }
}

/// Detect plan mode entry/exit from the EnterPlanMode / ExitPlanMode tools.
pub(crate) fn detect_plan_mode(event: &HookEvent, state: &mut WorkflowState) {
    match event.tool_name() {
        Some("EnterPlanMode") => {
            state.variables.insert("plan_mode".into(), Value::Bool(true));
            info!(session_id = %state.session_id, "plan_mode=true (entered plan mode)");
        }
        Some("ExitPlanMode") => {
            state.variables.insert("plan_mode".into(), Value::Bool(false));
            info!(session_id = %state.session_id, "plan_mode=false (exited plan mode)");
        }
        _ => {}
    }
}

fn reminder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<system-reminder>(.*?)</system-reminder>").unwrap()
    })
}

const PLAN_MODE_ACTIVE: [&str; 3] = [
    "Plan mode is active",
    "Plan mode still active",
    "You are in plan mode",
];

const PLAN_MODE_EXITED: [&str; 2] = ["Exited Plan Mode", "Plan mode exited"];

/// Detect plan mode from system reminders inside the user prompt.
///
/// The transport injects reminders like "Plan mode is active" when the user
/// toggles plan mode in the UI rather than via a tool call. Only text inside
/// `<system-reminder>` tags counts; a user merely mentioning plan mode must
/// not flip the variable.
pub(crate) fn detect_plan_mode_from_context(event: &HookEvent, state: &mut WorkflowState) {
    let prompt = event.prompt();
    if prompt.is_empty() {
        return;
    }

    let reminder_text: String = reminder_pattern()
        .captures_iter(prompt)
        .map(|caps| caps[1].to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if reminder_text.is_empty() {
        return;
    }

    for indicator in PLAN_MODE_ACTIVE {
        if reminder_text.contains(indicator) {
            if state.variables.get("plan_mode").and_then(Value::as_bool) != Some(true) {
                state.variables.insert("plan_mode".into(), Value::Bool(true));
                info!(session_id = %state.session_id, indicator, "plan_mode=true (system reminder)");
            }
            return;
        }
    }

    for indicator in PLAN_MODE_EXITED {
        if reminder_text.contains(indicator) {
            if state.variables.get("plan_mode").and_then(Value::as_bool) == Some(true) {
                state.variables.insert("plan_mode".into(), Value::Bool(false));
                info!(session_id = %state.session_id, indicator, "plan_mode=false (system reminder)");
            }
            return;
        }
    }
}

/// Track successful MCP calls for `mcp_called()` / `mcp_result_is_null()` /
/// `mcp_failed()` conditions: the call list per server, and the latest
/// result per (server, tool).
///
/// Returns whether the call succeeded, for the on_mcp handlers.
pub(crate) fn detect_mcp_call(event: &HookEvent, state: &mut WorkflowState) -> Option<bool> {
    let server = event.mcp_server()?.to_string();
    let tool = event.mcp_tool()?.to_string();
    let tool_output = event.tool_output().cloned().unwrap_or(Value::Null);

    if output_is_error(&tool_output) {
        return Some(false);
    }
    let result = tool_output.get("result").cloned().unwrap_or(Value::Null);

    let calls = state
        .variables
        .entry("mcp_calls".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(calls) = calls.as_object_mut() {
        let server_calls = calls
            .entry(server.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = server_calls.as_array_mut() {
            if !list.iter().any(|entry| entry.as_str() == Some(&tool)) {
                list.push(Value::String(tool.clone()));
            }
        }
    }

    let results = state
        .variables
        .entry("mcp_results".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(results) = results.as_object_mut() {
        let server_results = results
            .entry(server.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = server_results.as_object_mut() {
            map.insert(tool.clone(), result);
        }
    }

    debug!(session_id = %state.session_id, server, tool, "MCP call tracked");
    Some(true)
}

/// Run a step's `on_mcp_success` / `on_mcp_error` handlers for a completed
/// MCP call. Handlers support `set_variable` with an optional template
/// rendered against `{result, variables}`.
pub(crate) fn process_mcp_handlers(
    state: &mut WorkflowState,
    server: &str,
    tool: &str,
    succeeded: bool,
    on_mcp_success: &[ActionDef],
    on_mcp_error: &[ActionDef],
    template: &TemplateEngine,
) {
    let handlers = if succeeded { on_mcp_success } else { on_mcp_error };
    let handler_kind = if succeeded { "on_mcp_success" } else { "on_mcp_error" };

    for handler in handlers {
        let handler_server = handler.get("server").and_then(Value::as_str).unwrap_or("");
        let handler_tool = handler.get("tool").and_then(Value::as_str).unwrap_or("");
        if handler_server != server {
            continue;
        }
        if !handler_tool.is_empty() && handler_tool != tool {
            continue;
        }

        let action = handler.get("action").and_then(Value::as_str).unwrap_or("");
        if action != "set_variable" {
            warn!(
                session_id = %state.session_id,
                handler = handler_kind,
                action,
                "unknown MCP handler action"
            );
            continue;
        }
        let Some(variable) = handler.get("variable").and_then(Value::as_str) else {
            continue;
        };

        let raw_value = handler.get("value").cloned().unwrap_or(Value::Null);
        let resolved = match &raw_value {
            Value::String(text) if text.contains("{{") => {
                let mcp_result = state
                    .variables
                    .get("mcp_results")
                    .and_then(|results| results.get(server))
                    .and_then(|server_results| server_results.get(tool))
                    .cloned()
                    .unwrap_or(Value::Null);
                let mut render_ctx = Map::new();
                render_ctx.insert("result".into(), mcp_result);
                render_ctx.insert("variables".into(), Value::Object(state.variables.clone()));
                match template.render(text, &render_ctx) {
                    Ok(rendered) => Value::String(rendered),
                    Err(e) => {
                        warn!(
                            session_id = %state.session_id,
                            handler = handler_kind,
                            error = %e,
                            "failed to render handler value"
                        );
                        Value::Null
                    }
                }
            }
            other => other.clone(),
        };

        info!(
            session_id = %state.session_id,
            handler = handler_kind,
            variable,
            server,
            tool,
            "MCP handler set variable"
        );
        state.variables.insert(variable.to_string(), resolved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gobby_types::{CollabResult, HookEventType, NewTask, TaskRecord};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn mcp_event(server: &str, tool: &str, input: Value, output: Value) -> HookEvent {
        let mut event = HookEvent::new(HookEventType::AfterTool);
        event.data.insert("tool_name".into(), json!("call_tool"));
        event.data.insert("mcp_server".into(), json!(server));
        event.data.insert("mcp_tool".into(), json!(tool));
        event.data.insert("tool_input".into(), input);
        event.data.insert("tool_output".into(), output);
        event
    }

    #[derive(Default)]
    struct ResolvingTasks {
        linked: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TaskStore for ResolvingTasks {
        async fn get_task(&self, task_ref: &str) -> Option<TaskRecord> {
            Some(TaskRecord {
                id: format!("uuid-for-{}", task_ref.trim_start_matches('#')),
                project_id: "p".into(),
                title: "t".into(),
                status: "open".into(),
                commits: vec![],
            })
        }
        async fn create_task(&self, _task: NewTask) -> CollabResult<TaskRecord> {
            Err(gobby_types::CollaboratorError::new("unused"))
        }
        async fn link_task(&self, session_id: &str, task_id: &str, _rel: &str) -> CollabResult<()> {
            self.linked.lock().push((session_id.into(), task_id.into()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_claim_via_claim_task_resolves_uuid_and_links() {
        let tasks: Arc<dyn TaskStore> = Arc::new(ResolvingTasks::default());
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let event = mcp_event(
            "gobby-tasks",
            "claim_task",
            json!({"arguments": {"task_id": "#42"}}),
            json!({"result": {"status": "claimed"}}),
        );

        detect_task_claim(&event, &mut state, Some(&tasks)).await;
        assert_eq!(state.variables["task_claimed"], json!(true));
        assert_eq!(state.variables["claimed_task_id"], json!("uuid-for-42"));
    }

    #[tokio::test]
    async fn test_update_task_requires_in_progress() {
        let tasks: Arc<dyn TaskStore> = Arc::new(ResolvingTasks::default());
        let mut state = WorkflowState::new("sess-1", "wf", "a");

        let event = mcp_event(
            "gobby-tasks",
            "update_task",
            json!({"arguments": {"task_id": "#1", "status": "done"}}),
            json!({"result": {}}),
        );
        detect_task_claim(&event, &mut state, Some(&tasks)).await;
        assert!(!state.variables.contains_key("task_claimed"));

        let event = mcp_event(
            "gobby-tasks",
            "update_task",
            json!({"arguments": {"task_id": "#1", "status": "in_progress"}}),
            json!({"result": {}}),
        );
        detect_task_claim(&event, &mut state, Some(&tasks)).await;
        assert_eq!(state.variables["task_claimed"], json!(true));
    }

    #[tokio::test]
    async fn test_create_task_uses_result_id() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let event = mcp_event(
            "gobby-tasks",
            "create_task",
            json!({"arguments": {"title": "x"}}),
            json!({"result": {"id": "uuid-99"}}),
        );
        detect_task_claim(&event, &mut state, None).await;
        assert_eq!(state.variables["claimed_task_id"], json!("uuid-99"));
    }

    #[tokio::test]
    async fn test_close_task_clears_claim() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        state.variables.insert("task_claimed".into(), json!(true));
        state.variables.insert("claimed_task_id".into(), json!("uuid-1"));

        let event = mcp_event("gobby-tasks", "close_task", json!({}), json!({"result": {}}));
        detect_task_claim(&event, &mut state, None).await;
        assert_eq!(state.variables["task_claimed"], json!(false));
        assert_eq!(state.variables["claimed_task_id"], Value::Null);
    }

    #[tokio::test]
    async fn test_failed_call_ignored() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let event = mcp_event(
            "gobby-tasks",
            "create_task",
            json!({}),
            json!({"error": "boom"}),
        );
        detect_task_claim(&event, &mut state, None).await;
        assert!(!state.variables.contains_key("task_claimed"));
    }

    #[tokio::test]
    async fn test_other_server_ignored() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let event = mcp_event("context7", "create_task", json!({}), json!({"result": {"id": "x"}}));
        detect_task_claim(&event, &mut state, None).await;
        assert!(state.variables.is_empty());
    }

    #[test]
    fn test_plan_mode_tools() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let mut event = HookEvent::new(HookEventType::AfterTool);
        event.data.insert("tool_name".into(), json!("EnterPlanMode"));
        detect_plan_mode(&event, &mut state);
        assert_eq!(state.variables["plan_mode"], json!(true));

        event.data.insert("tool_name".into(), json!("ExitPlanMode"));
        detect_plan_mode(&event, &mut state);
        assert_eq!(state.variables["plan_mode"], json!(false));
    }

    #[test]
    fn test_plan_mode_from_reminder_only() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let mut event = HookEvent::new(HookEventType::BeforeAgent);

        // Mention outside a reminder tag does not count
        event
            .data
            .insert("prompt".into(), json!("the docs say Plan mode is active sometimes"));
        detect_plan_mode_from_context(&event, &mut state);
        assert!(!state.variables.contains_key("plan_mode"));

        event.data.insert(
            "prompt".into(),
            json!("some text <system-reminder>Plan mode is active</system-reminder>"),
        );
        detect_plan_mode_from_context(&event, &mut state);
        assert_eq!(state.variables["plan_mode"], json!(true));

        event.data.insert(
            "prompt".into(),
            json!("<system-reminder>Exited Plan Mode</system-reminder>"),
        );
        detect_plan_mode_from_context(&event, &mut state);
        assert_eq!(state.variables["plan_mode"], json!(false));
    }

    #[test]
    fn test_mcp_call_tracking() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let event = mcp_event(
            "gobby-memory",
            "recall",
            json!({}),
            json!({"result": {"memories": []}}),
        );
        assert_eq!(detect_mcp_call(&event, &mut state), Some(true));
        // Duplicate calls do not duplicate the entry
        assert_eq!(detect_mcp_call(&event, &mut state), Some(true));

        assert_eq!(state.variables["mcp_calls"]["gobby-memory"], json!(["recall"]));
        assert_eq!(
            state.variables["mcp_results"]["gobby-memory"]["recall"],
            json!({"memories": []})
        );

        let failed = mcp_event("gobby-memory", "remember", json!({}), json!({"error": "x"}));
        assert_eq!(detect_mcp_call(&failed, &mut state), Some(false));
        assert!(
            !state.variables["mcp_calls"]["gobby-memory"]
                .as_array()
                .unwrap()
                .iter()
                .any(|v| v == "remember")
        );
    }

    #[test]
    fn test_mcp_handlers_set_variable() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        state.variables.insert(
            "mcp_results".into(),
            json!({"gobby-tasks": {"claim_task": {"id": "t-7"}}}),
        );

        let success_handlers: Vec<ActionDef> = vec![
            serde_json::from_value(json!({
                "server": "gobby-tasks",
                "tool": "claim_task",
                "action": "set_variable",
                "variable": "task_claimed",
                "value": true
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "server": "gobby-tasks",
                "action": "set_variable",
                "variable": "claimed_from_result",
                "value": "{{ result.id }}"
            }))
            .unwrap(),
        ];

        process_mcp_handlers(
            &mut state,
            "gobby-tasks",
            "claim_task",
            true,
            &success_handlers,
            &[],
            &TemplateEngine::new(),
        );

        assert_eq!(state.variables["task_claimed"], json!(true));
        assert_eq!(state.variables["claimed_from_result"], json!("t-7"));
    }

    #[test]
    fn test_mcp_handlers_error_path_and_server_filter() {
        let mut state = WorkflowState::new("sess-1", "wf", "a");
        let error_handlers: Vec<ActionDef> = vec![serde_json::from_value(json!({
            "server": "gobby-tasks",
            "action": "set_variable",
            "variable": "claim_failed",
            "value": true
        }))
        .unwrap()];

        // Wrong server: nothing happens
        process_mcp_handlers(
            &mut state,
            "context7",
            "docs",
            false,
            &[],
            &error_handlers,
            &TemplateEngine::new(),
        );
        assert!(state.variables.is_empty());

        process_mcp_handlers(
            &mut state,
            "gobby-tasks",
            "claim_task",
            false,
            &[],
            &error_handlers,
            &TemplateEngine::new(),
        );
        assert_eq!(state.variables["claim_failed"], json!(true));
    }
}

//! Evaluation-context building and rule resolution/enforcement.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use gobby_storage::WorkflowState;
use gobby_types::HookEvent;

use crate::definitions::{RuleAction, RuleDefinition, WorkflowDefinition};
use crate::expr::{ConditionEvaluator, HelperSources, build_condition_helpers};

/// Build the evaluation context for condition checking.
///
/// Variables are exposed both under `variables` (supporting dot access and
/// `.get()`) and flattened to the top level, so `task_claimed` and
/// `variables.task_claimed` both work in conditions.
pub(crate) fn build_eval_context(
    event: &HookEvent,
    state: &WorkflowState,
    session_info: Option<&Value>,
    project_info: Option<&Value>,
) -> Map<String, Value> {
    let mut ctx = Map::new();

    let mut event_view = Map::new();
    event_view.insert(
        "event_type".into(),
        Value::String(event.event_type.event_name().to_string()),
    );
    event_view.insert("data".into(), Value::Object(event.data.clone()));
    if let Some(source) = &event.source {
        event_view.insert("source".into(), Value::String(source.clone()));
    }
    ctx.insert("event".into(), Value::Object(event_view));

    ctx.insert(
        "workflow_state".into(),
        serde_json::to_value(state).unwrap_or(Value::Null),
    );
    ctx.insert("variables".into(), Value::Object(state.variables.clone()));
    ctx.insert(
        "session".into(),
        session_info.cloned().unwrap_or(Value::Object(Map::new())),
    );
    ctx.insert(
        "project".into(),
        project_info.cloned().unwrap_or(Value::Object(Map::new())),
    );
    ctx.insert(
        "tool_name".into(),
        event
            .tool_name()
            .map(|name| Value::String(name.to_string()))
            .unwrap_or(Value::Null),
    );
    ctx.insert(
        "tool_args".into(),
        event
            .tool_input()
            .map(|input| Value::Object(input.clone()))
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    ctx.insert("step".into(), Value::String(state.step.clone()));
    ctx.insert(
        "step_action_count".into(),
        Value::from(state.step_action_count),
    );
    ctx.insert(
        "total_action_count".into(),
        Value::from(state.total_action_count),
    );

    // Flattened variables go last; the explicit keys above win on collision.
    for (key, value) in &state.variables {
        ctx.entry(key.clone()).or_insert_with(|| value.clone());
    }

    ctx
}

/// Resolve `check_rules` names to rule definitions.
///
/// Resolution order: the workflow's own `rule_definitions` (file-local plus
/// imported), then the tiered DB rule store. Unknown names are logged and
/// skipped.
pub(crate) fn resolve_check_rules(
    check_rules: &[String],
    workflow: &WorkflowDefinition,
    rule_store: Option<&gobby_storage::RuleStore>,
    project_id: Option<&str>,
) -> Vec<RuleDefinition> {
    let mut resolved = Vec::new();

    for name in check_rules {
        if let Some(rule) = workflow.rule_definition(name) {
            resolved.push(rule);
            continue;
        }

        if let Some(store) = rule_store {
            match store.get_rule(name, project_id) {
                Ok(Some(stored)) => {
                    match serde_json::from_value::<RuleDefinition>(stored.definition.clone()) {
                        Ok(rule) => {
                            resolved.push(rule);
                            continue;
                        }
                        Err(e) => {
                            warn!(rule = %name, error = %e, "invalid rule definition from DB");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(rule = %name, error = %e, "rule store lookup failed"),
            }
        }

        warn!(rule = %name, "check_rules: rule not found, skipping");
    }

    resolved
}

/// MCP call identity extracted from an event: `(server, tool)`.
pub(crate) fn mcp_identity(event: &HookEvent) -> Option<(String, String)> {
    let server = event.mcp_server().map(str::to_string).or_else(|| {
        event
            .tool_input()
            .and_then(|input| input.get("server_name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })?;
    let tool = event.mcp_tool().map(str::to_string).or_else(|| {
        event
            .tool_input()
            .and_then(|input| input.get("tool_name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })?;
    Some((server, tool))
}

/// Whether an `server:tool` pattern list entry matches the given call.
/// `server:*` matches every tool on a server.
pub(crate) fn mcp_pattern_matches(pattern: &str, server: &str, tool: &str) -> bool {
    match pattern.split_once(':') {
        Some((p_server, "*")) => p_server == server,
        Some((p_server, p_tool)) => p_server == server && p_tool == tool,
        None => pattern == server,
    }
}

/// Evaluate one block-rule against a tool call. Returns the rule's reason
/// when it fires with `action: block`.
pub(crate) fn evaluate_block_rule(
    rule: &RuleDefinition,
    event: &HookEvent,
    eval_ctx: &Map<String, Value>,
    evaluator: &ConditionEvaluator,
    helper_sources: &HelperSources,
) -> Option<String> {
    let tool_name = event.tool_name().unwrap_or_default();
    let mcp_call = mcp_identity(event);

    // Targeting: explicit tool list, MCP pattern list, or everything when
    // both lists are empty.
    let tool_targeted = !rule.tools.is_empty() && rule.tools.iter().any(|t| t == tool_name);
    let mcp_targeted = !rule.mcp_tools.is_empty()
        && mcp_call.as_ref().is_some_and(|(server, tool)| {
            rule.mcp_tools
                .iter()
                .any(|pattern| mcp_pattern_matches(pattern, server, tool))
        });
    let untargeted = rule.tools.is_empty() && rule.mcp_tools.is_empty();

    if !(tool_targeted || mcp_targeted || untargeted) {
        return None;
    }

    // Command pattern filters only apply when a command is present.
    if rule.command_pattern.is_some() || rule.command_not_pattern.is_some() {
        let command = event
            .tool_input()
            .and_then(|input| input.get("command"))
            .and_then(Value::as_str);
        let Some(command) = command else {
            return None;
        };
        if let Some(pattern) = &rule.command_pattern {
            if !regex_matches(pattern, command) {
                return None;
            }
        }
        if let Some(pattern) = &rule.command_not_pattern {
            if regex_matches(pattern, command) {
                return None;
            }
        }
    }

    if let Some(when) = &rule.when {
        let variables = eval_ctx
            .get("variables")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let helpers = build_condition_helpers(helper_sources, &variables);
        if !evaluator.evaluate_with_helpers(when, eval_ctx, &helpers) {
            return None;
        }
    }

    match rule.action {
        RuleAction::Block => Some(rule.reason.clone()),
        RuleAction::Warn => {
            warn!(tool = tool_name, reason = %rule.reason, "tool rule warning");
            None
        }
        RuleAction::Allow | RuleAction::RequireApproval => {
            debug!(tool = tool_name, action = ?rule.action, "rule action treated as allow");
            None
        }
    }
}

fn regex_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            warn!(pattern, error = %e, "invalid rule regex, rule will never match");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gobby_types::HookEventType;
    use serde_json::json;

    fn before_tool(tool: &str, input: Value) -> HookEvent {
        let mut event = HookEvent::new(HookEventType::BeforeTool);
        event.data.insert("tool_name".into(), json!(tool));
        event.data.insert("tool_input".into(), input);
        event
    }

    fn rule(value: Value) -> RuleDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn check(rule_def: &RuleDefinition, event: &HookEvent, state: &WorkflowState) -> Option<String> {
        let ctx = build_eval_context(event, state, None, None);
        evaluate_block_rule(
            rule_def,
            event,
            &ctx,
            &ConditionEvaluator::new(),
            &HelperSources::default(),
        )
    }

    #[test]
    fn test_eval_context_flattens_variables() {
        let mut state = WorkflowState::new("s", "wf", "implement");
        state.variables.insert("task_claimed".into(), json!(true));
        let event = before_tool("Edit", json!({}));

        let ctx = build_eval_context(&event, &state, None, None);
        assert_eq!(ctx["task_claimed"], json!(true));
        assert_eq!(ctx["variables"]["task_claimed"], json!(true));
        assert_eq!(ctx["tool_name"], json!("Edit"));
        assert_eq!(ctx["step"], json!("implement"));
    }

    #[test]
    fn test_tool_targeted_rule() {
        let state = WorkflowState::new("s", "wf", "a");
        let r = rule(json!({"tools": ["Bash"], "reason": "no shell"}));
        assert_eq!(
            check(&r, &before_tool("Bash", json!({})), &state),
            Some("no shell".into())
        );
        assert_eq!(check(&r, &before_tool("Read", json!({})), &state), None);
    }

    #[test]
    fn test_mcp_pattern_rule() {
        let state = WorkflowState::new("s", "wf", "a");
        let r = rule(json!({"mcp_tools": ["gobby-tasks:*"], "reason": "not yet"}));

        let mut event = before_tool("call_tool", json!({}));
        event.data.insert("mcp_server".into(), json!("gobby-tasks"));
        event.data.insert("mcp_tool".into(), json!("close_task"));
        assert_eq!(check(&r, &event, &state), Some("not yet".into()));

        let mut event = before_tool("call_tool", json!({}));
        event.data.insert("mcp_server".into(), json!("context7"));
        event.data.insert("mcp_tool".into(), json!("docs"));
        assert_eq!(check(&r, &event, &state), None);
    }

    #[test]
    fn test_command_patterns() {
        let state = WorkflowState::new("s", "wf", "a");
        let r = rule(json!({
            "tools": ["Bash"],
            "command_pattern": "rm -rf",
            "reason": "no recursive delete"
        }));
        assert_eq!(
            check(&r, &before_tool("Bash", json!({"command": "rm -rf /"})), &state),
            Some("no recursive delete".into())
        );
        assert_eq!(
            check(&r, &before_tool("Bash", json!({"command": "ls"})), &state),
            None
        );
        // No command present → pattern rules do not apply
        assert_eq!(check(&r, &before_tool("Bash", json!({})), &state), None);

        let not_rule = rule(json!({
            "tools": ["Bash"],
            "command_not_pattern": "^git ",
            "reason": "only git allowed"
        }));
        assert_eq!(
            check(&not_rule, &before_tool("Bash", json!({"command": "git status"})), &state),
            None
        );
        assert_eq!(
            check(&not_rule, &before_tool("Bash", json!({"command": "cargo run"})), &state),
            Some("only git allowed".into())
        );
    }

    #[test]
    fn test_when_condition_gates_rule() {
        let mut state = WorkflowState::new("s", "wf", "a");
        let r = rule(json!({
            "tools": ["Edit"],
            "when": "not task_claimed",
            "reason": "claim a task first"
        }));
        state.variables.insert("task_claimed".into(), json!(false));
        assert_eq!(
            check(&r, &before_tool("Edit", json!({})), &state),
            Some("claim a task first".into())
        );

        state.variables.insert("task_claimed".into(), json!(true));
        assert_eq!(check(&r, &before_tool("Edit", json!({})), &state), None);
    }

    #[test]
    fn test_warn_action_allows() {
        let state = WorkflowState::new("s", "wf", "a");
        let r = rule(json!({"tools": ["Bash"], "action": "warn", "reason": "careful"}));
        assert_eq!(check(&r, &before_tool("Bash", json!({})), &state), None);
    }

    #[test]
    fn test_resolve_check_rules_workflow_then_db() {
        let workflow: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: wf
rule_definitions:
  local-rule:
    tools: [Bash]
    reason: local
"#,
        )
        .unwrap();

        let db = gobby_storage::Database::open_in_memory().unwrap();
        let store = gobby_storage::RuleStore::new(db);
        store
            .put_rule(
                "db-rule",
                gobby_storage::RuleTier::User,
                &json!({"tools": ["Write"], "reason": "from db"}),
                None,
            )
            .unwrap();

        let resolved = resolve_check_rules(
            &["local-rule".into(), "db-rule".into(), "ghost".into()],
            &workflow,
            Some(&store),
            None,
        );
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].reason, "local");
        assert_eq!(resolved[1].reason, "from db");
    }

    #[test]
    fn test_mcp_pattern_matching() {
        assert!(mcp_pattern_matches("srv:tool", "srv", "tool"));
        assert!(mcp_pattern_matches("srv:*", "srv", "anything"));
        assert!(!mcp_pattern_matches("srv:tool", "srv", "other"));
        assert!(!mcp_pattern_matches("other:*", "srv", "tool"));
        assert!(mcp_pattern_matches("srv", "srv", "tool"));
    }
}

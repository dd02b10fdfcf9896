//! Typed records for workflow and pipeline YAML definitions.
//!
//! Definitions are immutable once loaded and shared read-only out of the
//! loader cache. Structural validation (step-name uniqueness, observer
//! variant exclusivity, pipeline execution modes) lives on `validate()`
//! methods the loader calls after parsing; reference-level validation is in
//! `loader::validate`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Result, WorkflowError};

/// A free-form action descriptor from YAML (`{action: ..., when: ..., ...}`).
pub type ActionDef = Map<String, Value>;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_priority() -> i64 {
    100
}

/// Accept numeric YAML versions (`1.0`, `2`) and coerce to string.
fn de_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => default_version(),
        other => other.to_string(),
    })
}

// ── Tool filters ────────────────────────────────────────────────────────

/// `"all"` or an explicit list of tool names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolFilter {
    Keyword(String),
    List(Vec<String>),
}

impl Default for ToolFilter {
    fn default() -> Self {
        ToolFilter::Keyword("all".to_string())
    }
}

impl ToolFilter {
    pub fn is_all(&self) -> bool {
        matches!(self, ToolFilter::Keyword(kw) if kw == "all")
    }

    pub fn contains(&self, tool: &str) -> bool {
        match self {
            ToolFilter::Keyword(kw) => kw == "all" || kw == tool,
            ToolFilter::List(tools) => tools.iter().any(|t| t == tool),
        }
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

/// What a matched rule does to the tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Block,
    Allow,
    RequireApproval,
    Warn,
}

/// An inline step rule: condition plus decision.
///
/// Only `block` takes effect in the rule path today; `warn` logs, `allow`
/// and `require_approval` are accepted but behave as allow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRule {
    #[serde(default)]
    pub name: Option<String>,
    pub when: String,
    pub action: RuleAction,
    #[serde(default)]
    pub message: Option<String>,
}

/// Named rule definition, usable at workflow level (`rule_definitions`), in
/// shared rule files (resolved via `imports`), and as top-level `tool_rules`
/// entries. Referenced by name from `check_rules` on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub tools: Vec<String>,
    /// `server:tool` or `server:*` patterns for MCP proxy calls.
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    #[serde(default)]
    pub when: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub action: RuleAction,
    /// Regex the Bash command must match for the rule to apply.
    #[serde(default)]
    pub command_pattern: Option<String>,
    /// Regex the Bash command must NOT match for the rule to apply.
    #[serde(default)]
    pub command_not_pattern: Option<String>,
}

// ── Observers ───────────────────────────────────────────────────────────

/// Watches events and sets variables, or invokes a registered behavior.
///
/// Exactly one variant must be specified: the YAML variant (`on` + `set`,
/// optional `match`) or the behavior reference (`behavior`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observer {
    pub name: String,
    /// Event name to observe (e.g. "after_tool").
    #[serde(default)]
    pub on: Option<String>,
    /// Optional filter (`tool`, `mcp_server`, `mcp_tool`), all exact-match.
    #[serde(default, rename = "match")]
    pub matcher: Option<Map<String, Value>>,
    /// Variable assignments: name → template expression.
    #[serde(default)]
    pub set: Option<Map<String, Value>>,
    /// Registered behavior name.
    #[serde(default)]
    pub behavior: Option<String>,
}

impl Observer {
    pub fn validate(&self) -> Result<()> {
        let is_yaml = self.on.is_some() || self.matcher.is_some() || self.set.is_some();
        let is_behavior = self.behavior.is_some();
        if is_yaml && is_behavior {
            return Err(WorkflowError::invalid(
                &self.name,
                "observer must specify exactly one variant: on/match/set or behavior, not both",
            ));
        }
        if !is_yaml && !is_behavior {
            return Err(WorkflowError::invalid(
                &self.name,
                "observer must specify exactly one variant: on/match/set or behavior",
            ));
        }
        Ok(())
    }
}

// ── Exit conditions ─────────────────────────────────────────────────────

/// Either a bare expression string or a typed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExitCondition {
    Expression(String),
    Record(Map<String, Value>),
}

/// Normalized view of an exit condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitConditionKind {
    VariableSet {
        variable: String,
    },
    Expression {
        expression: String,
    },
    UserApproval {
        condition_id: String,
        prompt: String,
        timeout_seconds: Option<i64>,
    },
    Webhook {
        url: String,
    },
    Unknown,
}

impl ExitCondition {
    /// Resolve the condition to its normalized form, expanding the
    /// `{approval: str}` and `{webhook: {...}}` sugar.
    pub fn normalized(&self) -> ExitConditionKind {
        let record = match self {
            ExitCondition::Expression(expr) => {
                return ExitConditionKind::Expression {
                    expression: expr.clone(),
                };
            }
            ExitCondition::Record(record) => record,
        };

        // Sugar forms first
        if let Some(prompt) = record.get("approval").and_then(Value::as_str) {
            return ExitConditionKind::UserApproval {
                condition_id: record
                    .get("condition_id")
                    .and_then(Value::as_str)
                    .unwrap_or("approval")
                    .to_string(),
                prompt: prompt.to_string(),
                timeout_seconds: record.get("timeout_seconds").and_then(Value::as_i64),
            };
        }
        if let Some(webhook) = record.get("webhook").and_then(Value::as_object) {
            return ExitConditionKind::Webhook {
                url: webhook
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
        }

        match record.get("type").and_then(Value::as_str) {
            Some("variable_set") => ExitConditionKind::VariableSet {
                variable: record
                    .get("variable")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("expression") => ExitConditionKind::Expression {
                expression: record
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("user_approval") => ExitConditionKind::UserApproval {
                condition_id: record
                    .get("condition_id")
                    .and_then(Value::as_str)
                    .unwrap_or("approval")
                    .to_string(),
                prompt: record
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("Approve?")
                    .to_string(),
                timeout_seconds: record.get("timeout_seconds").and_then(Value::as_i64),
            },
            Some("webhook") => ExitConditionKind::Webhook {
                url: record
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => ExitConditionKind::Unknown,
        }
    }
}

// ── Steps & transitions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub to: String,
    pub when: String,
    #[serde(default)]
    pub on_transition: Vec<ActionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Template rendered after on_enter, returned as the system message.
    #[serde(default)]
    pub status_message: Option<String>,

    #[serde(default)]
    pub on_enter: Vec<ActionDef>,
    #[serde(default)]
    pub on_exit: Vec<ActionDef>,

    #[serde(default)]
    pub allowed_tools: ToolFilter,
    #[serde(default)]
    pub blocked_tools: Vec<String>,

    /// MCP restrictions in `server:tool` or `server:*` form.
    #[serde(default)]
    pub allowed_mcp_tools: ToolFilter,
    #[serde(default)]
    pub blocked_mcp_tools: Vec<String>,

    #[serde(default)]
    pub rules: Vec<WorkflowRule>,
    /// Named rule references, resolved against `rule_definitions` + DB tiers.
    #[serde(default)]
    pub check_rules: Vec<String>,

    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
    /// Expression shorthand AND-ed with exit_conditions.
    #[serde(default)]
    pub exit_when: Option<String>,
    #[serde(default)]
    pub exit_conditions: Vec<ExitCondition>,

    /// Handlers that run when a matching MCP call completes.
    #[serde(default)]
    pub on_mcp_success: Vec<ActionDef>,
    #[serde(default)]
    pub on_mcp_error: Vec<ActionDef>,
}

// ── Premature stop ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrematureStopAction {
    #[default]
    GuideContinuation,
    Block,
    Warn,
}

fn default_premature_stop_message() -> String {
    "Task has incomplete subtasks. Options: \
     1) Continue: use suggest_next_task() to find the next task. \
     2) Stop anyway: deactivate the workflow first."
        .to_string()
}

/// Handler for when an agent attempts to stop before task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrematureStopHandler {
    #[serde(default)]
    pub action: PrematureStopAction,
    #[serde(default = "default_premature_stop_message")]
    pub message: String,
    /// Optional condition that must be FALSE for the stop to count as
    /// premature (e.g. `task_tree_complete(claimed_task_id)`).
    #[serde(default)]
    pub condition: Option<String>,
}

// ── Workflow definition ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version", deserialize_with = "de_version")]
    pub version: String,
    #[serde(default)]
    pub extends: Option<String>,

    /// `true` makes this an always-on (lifecycle) workflow that runs on
    /// every matching event; `false` is on-demand and only runs once
    /// explicitly activated for a session.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Evaluation order within a discovery bucket; lower runs first.
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Session sources this workflow applies to (None = all).
    #[serde(default)]
    pub sources: Option<Vec<String>>,

    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Session-scoped shared variables, visible to all workflows.
    #[serde(default)]
    pub session_variables: Map<String, Value>,

    /// Named rule definitions (file-local, merged with imports).
    #[serde(default)]
    pub rule_definitions: Map<String, Value>,
    /// Cross-file rule imports.
    #[serde(default)]
    pub imports: Vec<String>,

    /// Top-level tool blocking rules, evaluated on BEFORE_TOOL events before
    /// trigger actions run.
    #[serde(default)]
    pub tool_rules: Vec<RuleDefinition>,

    #[serde(default)]
    pub observers: Vec<Observer>,

    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    /// Event-name → action list (`on_session_start`, ...).
    #[serde(default)]
    pub triggers: Map<String, Value>,

    #[serde(default)]
    pub on_error: Vec<ActionDef>,
    #[serde(default)]
    pub on_premature_stop: Option<PrematureStopHandler>,
    /// Exit condition for the entire workflow.
    #[serde(default)]
    pub exit_condition: Option<String>,

    /// Unknown top-level keys, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn get_step(&self, step_name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == step_name)
    }

    /// Trigger action descriptors for a trigger key.
    pub fn trigger_actions(&self, trigger_key: &str) -> Vec<&ActionDef> {
        self.triggers
            .get(trigger_key)
            .and_then(Value::as_array)
            .map(|actions| actions.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default()
    }

    /// Typed rule definitions, keyed by name.
    pub fn rule_definition(&self, name: &str) -> Option<RuleDefinition> {
        self.rule_definitions
            .get(name)
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
    }

    /// Structural validation: unique step names, known transition targets,
    /// valid observer variants.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(WorkflowError::invalid(&self.name, "step name cannot be empty"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(WorkflowError::invalid(
                    &self.name,
                    format!("duplicate step name: {}", step.name),
                ));
            }
        }
        for step in &self.steps {
            for transition in &step.transitions {
                if !seen.contains(transition.to.as_str()) {
                    return Err(WorkflowError::invalid(
                        &self.name,
                        format!(
                            "step '{}' transition targets unknown step '{}'",
                            step.name, transition.to
                        ),
                    ));
                }
            }
        }
        for observer in &self.observers {
            observer.validate()?;
        }
        Ok(())
    }
}

// ── Pipelines ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub on_approval_pending: Option<WebhookEndpoint>,
    #[serde(default)]
    pub on_complete: Option<WebhookEndpoint>,
    #[serde(default)]
    pub on_failure: Option<WebhookEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineApproval {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

/// Configuration for an MCP tool call step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpStepConfig {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
}

/// A single step in a pipeline. Exactly one execution mode is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,

    // Execution modes (mutually exclusive)
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub invoke_pipeline: Option<Value>,
    #[serde(default)]
    pub mcp: Option<McpStepConfig>,
    #[serde(default)]
    pub spawn_session: Option<Map<String, Value>>,
    #[serde(default)]
    pub activate_workflow: Option<Map<String, Value>>,

    // Optional fields
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub approval: Option<PipelineApproval>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Explicit input reference (e.g. `$prev_step.output`).
    #[serde(default)]
    pub input: Option<String>,
}

impl PipelineStep {
    /// Enforce the exactly-one-execution-mode invariant.
    pub fn validate(&self) -> Result<()> {
        let specified = [
            self.exec.is_some(),
            self.prompt.is_some(),
            self.invoke_pipeline.is_some(),
            self.mcp.is_some(),
            self.spawn_session.is_some(),
            self.activate_workflow.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        if specified == 0 {
            return Err(WorkflowError::invalid(
                &self.id,
                "pipeline step requires one of: exec, prompt, invoke_pipeline, mcp, spawn_session, activate_workflow",
            ));
        }
        if specified > 1 {
            return Err(WorkflowError::invalid(
                &self.id,
                "pipeline step execution modes are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// A sequential DAG of typed steps with explicit `$step.output` data flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version", deserialize_with = "de_version")]
    pub version: String,

    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default)]
    pub steps: Vec<PipelineStep>,

    #[serde(default)]
    pub webhooks: Option<WebhookConfig>,
    #[serde(default)]
    pub expose_as_tool: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineDefinition {
    pub fn get_step(&self, step_id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::invalid(&self.name, "pipeline requires at least one step"));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::invalid(
                    &self.name,
                    format!("duplicate pipeline step id: {}", step.id),
                ));
            }
            step.validate()?;
        }
        Ok(())
    }
}

// ── Loaded definition ───────────────────────────────────────────────────

/// A loaded definition: step/lifecycle workflow or pipeline.
#[derive(Debug, Clone)]
pub enum AnyDefinition {
    Workflow(Arc<WorkflowDefinition>),
    Pipeline(Arc<PipelineDefinition>),
}

impl AnyDefinition {
    pub fn name(&self) -> &str {
        match self {
            AnyDefinition::Workflow(w) => &w.name,
            AnyDefinition::Pipeline(p) => &p.name,
        }
    }

    pub fn as_workflow(&self) -> Option<&Arc<WorkflowDefinition>> {
        match self {
            AnyDefinition::Workflow(w) => Some(w),
            AnyDefinition::Pipeline(_) => None,
        }
    }

    pub fn as_pipeline(&self) -> Option<&Arc<PipelineDefinition>> {
        match self {
            AnyDefinition::Pipeline(p) => Some(p),
            AnyDefinition::Workflow(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STEP_WORKFLOW: &str = r#"
name: dev-loop
enabled: false
variables:
  ready: false
steps:
  - name: plan
    allowed_tools: all
    transitions:
      - to: implement
        when: "ready"
  - name: implement
    blocked_tools: [Bash]
    on_enter:
      - action: inject_message
        content: "now implementing"
"#;

    #[test]
    fn test_parse_step_workflow() {
        let wf: WorkflowDefinition = serde_yaml::from_str(STEP_WORKFLOW).unwrap();
        wf.validate().unwrap();
        assert_eq!(wf.name, "dev-loop");
        assert!(!wf.enabled);
        assert_eq!(wf.priority, 100);
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.steps[0].allowed_tools.is_all());
        assert_eq!(wf.steps[1].blocked_tools, vec!["Bash"]);
        assert_eq!(wf.steps[0].transitions[0].to, "implement");
        assert_eq!(wf.get_step("plan").unwrap().name, "plan");
        assert!(wf.get_step("missing").is_none());
    }

    #[test]
    fn test_first_step_is_initial() {
        let wf: WorkflowDefinition = serde_yaml::from_str(STEP_WORKFLOW).unwrap();
        assert_eq!(wf.get_step(&wf.steps[0].name).unwrap().name, wf.steps[0].name);
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let yaml = r#"
name: dup
steps:
  - name: a
  - name: a
"#;
        let wf: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn test_unknown_transition_target_rejected() {
        let yaml = r#"
name: bad
steps:
  - name: a
    transitions:
      - to: nowhere
        when: "true"
"#;
        let wf: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_numeric_version_coerced() {
        let wf: WorkflowDefinition = serde_yaml::from_str("name: v\nversion: 2\n").unwrap();
        assert_eq!(wf.version, "2");
        let wf: WorkflowDefinition = serde_yaml::from_str("name: v\nversion: '1.1'\n").unwrap();
        assert_eq!(wf.version, "1.1");
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let wf: WorkflowDefinition =
            serde_yaml::from_str("name: v\nfuture_field: {a: 1}\n").unwrap();
        assert_eq!(wf.extra["future_field"], json!({"a": 1}));
    }

    #[test]
    fn test_tool_filter_contains() {
        let all = ToolFilter::default();
        assert!(all.is_all());
        assert!(all.contains("anything"));

        let list = ToolFilter::List(vec!["Read".into(), "Edit".into()]);
        assert!(list.contains("Read"));
        assert!(!list.contains("Bash"));
    }

    #[test]
    fn test_observer_variant_exclusivity() {
        let both = Observer {
            name: "bad".into(),
            on: Some("after_tool".into()),
            matcher: None,
            set: Some(Map::new()),
            behavior: Some("track".into()),
        };
        assert!(both.validate().is_err());

        let neither = Observer {
            name: "empty".into(),
            on: None,
            matcher: None,
            set: None,
            behavior: None,
        };
        assert!(neither.validate().is_err());

        let yaml_variant = Observer {
            name: "ok".into(),
            on: Some("after_tool".into()),
            matcher: None,
            set: Some(Map::new()),
            behavior: None,
        };
        yaml_variant.validate().unwrap();
    }

    #[test]
    fn test_exit_condition_normalization() {
        let expr = ExitCondition::Expression("done".into());
        assert_eq!(
            expr.normalized(),
            ExitConditionKind::Expression { expression: "done".into() }
        );

        let approval: ExitCondition = serde_json::from_value(json!({
            "type": "user_approval",
            "condition_id": "go",
            "prompt": "Proceed?",
            "timeout_seconds": 60
        }))
        .unwrap();
        assert_eq!(
            approval.normalized(),
            ExitConditionKind::UserApproval {
                condition_id: "go".into(),
                prompt: "Proceed?".into(),
                timeout_seconds: Some(60),
            }
        );

        // Sugar forms
        let sugar: ExitCondition = serde_json::from_value(json!({"approval": "Ship it?"})).unwrap();
        assert!(matches!(
            sugar.normalized(),
            ExitConditionKind::UserApproval { prompt, .. } if prompt == "Ship it?"
        ));
        let webhook: ExitCondition =
            serde_json::from_value(json!({"webhook": {"url": "http://x"}})).unwrap();
        assert!(matches!(
            webhook.normalized(),
            ExitConditionKind::Webhook { url } if url == "http://x"
        ));
    }

    #[test]
    fn test_pipeline_step_mode_exclusivity() {
        let yaml = r#"
name: pipe
type: pipeline
steps:
  - id: one
    exec: "echo hi"
    prompt: "also a prompt"
"#;
        let pipeline: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_pipeline_step_mode_required() {
        let yaml = r#"
name: pipe
type: pipeline
steps:
  - id: one
"#;
        let pipeline: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_pipeline_duplicate_ids_rejected() {
        let yaml = r#"
name: pipe
type: pipeline
steps:
  - id: one
    exec: "a"
  - id: one
    exec: "b"
"#;
        let pipeline: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate pipeline step id"));
    }

    #[test]
    fn test_trigger_actions_accessor() {
        let yaml = r#"
name: t
triggers:
  on_session_start:
    - action: inject_context
      source: handoff
"#;
        let wf: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let actions = wf.trigger_actions("on_session_start");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["action"], json!("inject_context"));
        assert!(wf.trigger_actions("on_stop").is_empty());
    }

    #[test]
    fn test_rule_definition_lookup() {
        let yaml = r#"
name: t
rule_definitions:
  no-bash:
    tools: [Bash]
    reason: "not here"
"#;
        let wf: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        let rule = wf.rule_definition("no-bash").unwrap();
        assert_eq!(rule.tools, vec!["Bash"]);
        assert_eq!(rule.action, RuleAction::Block);
        assert!(wf.rule_definition("missing").is_none());
    }
}

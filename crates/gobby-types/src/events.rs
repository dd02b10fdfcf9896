//! Hook event types exchanged with assistant transports.
//!
//! These types are shared between the hook HTTP handler (which converts
//! assistant-native payloads into [`HookEvent`]) and the workflow engine
//! (which consumes events and produces [`HookResponse`]s).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Metadata key carrying the daemon-side session id.
pub const PLATFORM_SESSION_ID: &str = "_platform_session_id";

/// Metadata key carrying the parent session id, if any.
pub const PARENT_SESSION_ID: &str = "_parent_session_id";

/// A lifecycle event reported by an assistant transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEventType {
    /// A new assistant session began.
    SessionStart,
    /// The session ended.
    SessionEnd,
    /// The user submitted a prompt; fires before the agent turn.
    BeforeAgent,
    /// The agent turn finished.
    AfterAgent,
    /// A tool is about to run. Can block execution.
    BeforeTool,
    /// A tool finished running.
    AfterTool,
    /// The agent attempted to stop.
    Stop,
    /// An out-of-band notification from the transport.
    Notification,
    /// The transport is about to compact its context.
    PreCompact,
}

impl HookEventType {
    /// The canonical trigger key for this event (`on_before_tool`, ...).
    pub fn trigger_key(&self) -> &'static str {
        match self {
            HookEventType::SessionStart => "on_session_start",
            HookEventType::SessionEnd => "on_session_end",
            HookEventType::BeforeAgent => "on_before_agent",
            HookEventType::AfterAgent => "on_after_agent",
            HookEventType::BeforeTool => "on_before_tool",
            HookEventType::AfterTool => "on_after_tool",
            HookEventType::Stop => "on_stop",
            HookEventType::Notification => "on_notification",
            HookEventType::PreCompact => "on_pre_compact",
        }
    }

    /// The bare event name used by observers (`before_tool`, ...).
    pub fn event_name(&self) -> &'static str {
        self.trigger_key()
            .strip_prefix("on_")
            .unwrap_or(self.trigger_key())
    }
}

impl std::fmt::Display for HookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A hook event delivered to the workflow engine.
///
/// `data` is the free-form payload normalized by the transport adapter
/// (`tool_name`, `tool_input`, `tool_output`, `mcp_server`, `mcp_tool`,
/// `prompt`, ...). `metadata` carries daemon-side routing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub event_type: HookEventType,
    /// Assistant source name (e.g. "claude", "gemini").
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl HookEvent {
    /// Create a bare event of the given type.
    pub fn new(event_type: HookEventType) -> Self {
        Self {
            event_type,
            source: None,
            data: Map::new(),
            metadata: Map::new(),
            cwd: None,
            machine_id: None,
            project_id: None,
        }
    }

    /// The daemon-side session id from metadata, if present.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get(PLATFORM_SESSION_ID).and_then(Value::as_str)
    }

    /// The parent session id from metadata, if present.
    pub fn parent_session_id(&self) -> Option<&str> {
        self.metadata.get(PARENT_SESSION_ID).and_then(Value::as_str)
    }

    /// Project path for workflow discovery: top-level `cwd` wins, with a
    /// fallback to `data.cwd` for older adapters.
    pub fn project_path(&self) -> Option<PathBuf> {
        if let Some(cwd) = &self.cwd {
            return Some(cwd.clone());
        }
        self.data.get("cwd").and_then(Value::as_str).map(PathBuf::from)
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.data.get("tool_name").and_then(Value::as_str)
    }

    /// Normalized MCP server name, set by the adapter for MCP proxy calls.
    pub fn mcp_server(&self) -> Option<&str> {
        self.data.get("mcp_server").and_then(Value::as_str)
    }

    /// Normalized inner MCP tool name.
    pub fn mcp_tool(&self) -> Option<&str> {
        self.data.get("mcp_tool").and_then(Value::as_str)
    }

    pub fn tool_input(&self) -> Option<&Map<String, Value>> {
        self.data.get("tool_input").and_then(Value::as_object)
    }

    pub fn tool_output(&self) -> Option<&Value> {
        self.data.get("tool_output")
    }

    /// The user prompt text, for BeforeAgent events.
    pub fn prompt(&self) -> &str {
        self.data.get("prompt").and_then(Value::as_str).unwrap_or("")
    }
}

/// Decision returned to the assistant transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Allow,
    Block,
    Deny,
    Ask,
    Modify,
}

/// Response to a hook event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HookResponse {
    pub decision: Decision,
    /// Reason shown when the decision is not allow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Content injected into the assistant context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// User-visible status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl HookResponse {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn modify(context: impl Into<String>) -> Self {
        Self {
            decision: Decision::Modify,
            context: Some(context.into()),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_key_mapping() {
        assert_eq!(HookEventType::BeforeTool.trigger_key(), "on_before_tool");
        assert_eq!(HookEventType::SessionStart.trigger_key(), "on_session_start");
        assert_eq!(HookEventType::Stop.event_name(), "stop");
        assert_eq!(HookEventType::AfterTool.event_name(), "after_tool");
    }

    #[test]
    fn test_event_accessors() {
        let mut event = HookEvent::new(HookEventType::AfterTool);
        event.data.insert("tool_name".into(), json!("Bash"));
        event.data.insert("mcp_server".into(), json!("gobby-tasks"));
        event.data.insert("mcp_tool".into(), json!("claim_task"));
        event
            .metadata
            .insert(PLATFORM_SESSION_ID.into(), json!("sess-1"));

        assert_eq!(event.tool_name(), Some("Bash"));
        assert_eq!(event.mcp_server(), Some("gobby-tasks"));
        assert_eq!(event.mcp_tool(), Some("claim_task"));
        assert_eq!(event.session_id(), Some("sess-1"));
        assert_eq!(event.parent_session_id(), None);
    }

    #[test]
    fn test_project_path_prefers_top_level_cwd() {
        let mut event = HookEvent::new(HookEventType::BeforeAgent);
        event.data.insert("cwd".into(), json!("/from/data"));
        assert_eq!(event.project_path(), Some(PathBuf::from("/from/data")));

        event.cwd = Some(PathBuf::from("/from/event"));
        assert_eq!(event.project_path(), Some(PathBuf::from("/from/event")));
    }

    #[test]
    fn test_decision_serde_roundtrip() {
        let json = serde_json::to_string(&Decision::Block).unwrap();
        assert_eq!(json, "\"block\"");
        let parsed: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Decision::Block);
    }

    #[test]
    fn test_event_type_serde() {
        let json = serde_json::to_string(&HookEventType::BeforeTool).unwrap();
        assert_eq!(json, "\"before_tool\"");
        let parsed: HookEventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, HookEventType::BeforeTool);
    }

    #[test]
    fn test_response_constructors() {
        let resp = HookResponse::block("nope");
        assert_eq!(resp.decision, Decision::Block);
        assert_eq!(resp.reason.as_deref(), Some("nope"));

        let resp = HookResponse::allow().with_context("hello");
        assert_eq!(resp.decision, Decision::Allow);
        assert_eq!(resp.context.as_deref(), Some("hello"));
    }
}

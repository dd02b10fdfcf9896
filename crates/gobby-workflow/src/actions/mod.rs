//! Action registry and execution context.
//!
//! An action is a named async function invoked from triggers, step
//! `on_enter`/`on_exit`/`on_transition` lists, and premature-stop handlers.
//! Actions return a tagged [`ActionOutput`] the engine folds into the hook
//! response: injected context, user-visible messages, a block decision, or
//! variable updates that thread through the shared `context_data`.

mod context_actions;
mod llm_actions;
mod memory_actions;
mod task_actions;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{error, warn};

use gobby_storage::{WorkflowState, WorkflowStateManager};
use gobby_types::{
    LlmService, MemoryStore, MemorySync, SessionStore, SkillLearner, StopRegistry, TaskConditions,
    TaskStore, ToolProxy,
};

use crate::definitions::ActionDef;
use crate::template::TemplateEngine;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<crate::error::WorkflowError> for ActionError {
    fn from(e: crate::error::WorkflowError) -> Self {
        ActionError(e.to_string())
    }
}

pub type ActionResult = Result<ActionOutput, ActionError>;

/// Tagged result of an action. The engine folds these; actions never write
/// to the hook response directly.
#[derive(Debug, Clone)]
pub enum ActionOutput {
    Empty,
    /// Content appended to the merged context returned to the assistant.
    Inject(String),
    /// User-visible message, also injected into the assistant context.
    Message(String),
    /// User-visible status line (last one wins).
    System(String),
    /// Stop the event and return a block decision.
    Block { reason: String },
    /// Variable updates merged into state variables and shared context.
    Vars(Map<String, Value>),
    Multi(Vec<ActionOutput>),
}

impl ActionOutput {
    pub fn vars(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        ActionOutput::Vars(entries.into_iter().collect())
    }

    pub fn var(key: impl Into<String>, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value);
        ActionOutput::Vars(map)
    }
}

/// Folded view of one or more action outputs.
#[derive(Debug, Default, Clone)]
pub struct ActionEffects {
    pub injected_context: Vec<String>,
    pub injected_messages: Vec<String>,
    pub system_message: Option<String>,
    pub block_reason: Option<String>,
    pub vars: Map<String, Value>,
}

impl ActionEffects {
    pub fn absorb(&mut self, output: ActionOutput) {
        match output {
            ActionOutput::Empty => {}
            ActionOutput::Inject(content) => self.injected_context.push(content),
            ActionOutput::Message(message) => self.injected_messages.push(message),
            ActionOutput::System(message) => self.system_message = Some(message),
            ActionOutput::Block { reason } => {
                if self.block_reason.is_none() {
                    self.block_reason = Some(reason);
                }
            }
            ActionOutput::Vars(vars) => {
                for (key, value) in vars {
                    self.vars.insert(key, value);
                }
            }
            ActionOutput::Multi(outputs) => {
                for inner in outputs {
                    self.absorb(inner);
                }
            }
        }
    }

    /// All injected content (context + messages) in arrival order.
    pub fn all_injected(&self) -> Vec<String> {
        let mut all = self.injected_context.clone();
        all.extend(self.injected_messages.clone());
        all
    }
}

/// Configuration knobs actions read.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub compact_handoff_enabled: bool,
    /// Template with `{section}` placeholders for the compact handoff.
    pub compact_handoff_prompt: Option<String>,
    pub memory_min_importance: f64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            compact_handoff_enabled: true,
            compact_handoff_prompt: None,
            memory_min_importance: 0.5,
        }
    }
}

/// Typed handles to the daemon services actions collaborate with. Every
/// handle is optional; actions degrade to an error result when a required
/// service is missing.
#[derive(Default)]
pub struct Services {
    pub sessions: Option<Arc<dyn SessionStore>>,
    pub tasks: Option<Arc<dyn TaskStore>>,
    pub task_conditions: Option<Arc<dyn TaskConditions>>,
    pub tool_proxy: Option<Arc<dyn ToolProxy>>,
    pub llm: Option<Arc<dyn LlmService>>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub memory_sync: Option<Arc<dyn MemorySync>>,
    pub stop_registry: Option<Arc<dyn StopRegistry>>,
    pub skills: Option<Arc<dyn SkillLearner>>,
    pub config: ActionConfig,
}

/// Context passed to action handlers.
///
/// The workflow state is shared behind a mutex: actions mutate variables in
/// place and the engine persists the diff afterwards. Locks are held only
/// for synchronous mutation, never across awaits.
#[derive(Clone)]
pub struct ActionContext {
    pub session_id: String,
    pub state: Arc<Mutex<WorkflowState>>,
    pub event_data: Map<String, Value>,
    pub project_path: Option<PathBuf>,
    pub template: TemplateEngine,
    pub services: Arc<Services>,
    pub state_manager: Option<WorkflowStateManager>,
}

impl ActionContext {
    pub fn new(session_id: impl Into<String>, state: WorkflowState, services: Arc<Services>) -> Self {
        Self {
            session_id: session_id.into(),
            state: Arc::new(Mutex::new(state)),
            event_data: Map::new(),
            project_path: None,
            template: TemplateEngine::new(),
            services,
            state_manager: None,
        }
    }

    pub fn with_event_data(mut self, event_data: Map<String, Value>) -> Self {
        self.event_data = event_data;
        self
    }

    pub fn with_project_path(mut self, project_path: Option<PathBuf>) -> Self {
        self.project_path = project_path;
        self
    }

    pub fn with_state_manager(mut self, state_manager: WorkflowStateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    /// Snapshot of the state variables.
    pub fn variables(&self) -> Map<String, Value> {
        self.state.lock().variables.clone()
    }

    /// Set one state variable.
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.state.lock().variables.insert(name.into(), value);
    }

    /// Base template-render context: session snapshot, state, variables.
    pub(crate) async fn render_context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        let state = self.state.lock().clone();
        context.insert("session_id".into(), Value::String(self.session_id.clone()));
        context.insert(
            "state".into(),
            serde_json::to_value(&state).unwrap_or(Value::Null),
        );
        context.insert("variables".into(), Value::Object(state.variables.clone()));
        context.insert(
            "step_action_count".into(),
            Value::from(state.step_action_count),
        );
        if let Some(session) = self.session().await {
            context.insert(
                "session".into(),
                serde_json::to_value(&session).unwrap_or(Value::Null),
            );
        }
        context
    }

    pub(crate) async fn session(&self) -> Option<gobby_types::SessionRecord> {
        let sessions = self.services.sessions.as_ref()?;
        sessions.get(&self.session_id).await
    }
}

pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;
pub type ActionHandler = Arc<dyn Fn(ActionContext, ActionDef) -> ActionFuture + Send + Sync>;

macro_rules! handler {
    ($f:path) => {
        Arc::new(|ctx: ActionContext, args: ActionDef| -> ActionFuture {
            Box::pin(async move { $f(&ctx, &args).await })
        }) as ActionHandler
    };
}

/// Registry and executor for workflow actions.
pub struct ActionExecutor {
    handlers: HashMap<String, ActionHandler>,
    pub services: Arc<Services>,
}

impl ActionExecutor {
    pub fn new(services: Arc<Services>) -> Self {
        let mut executor = Self {
            handlers: HashMap::new(),
            services,
        };
        executor.register_defaults();
        executor
    }

    /// Register an action handler. Plugins may add new actions or shadow
    /// built-ins for a session-scoped executor.
    pub fn register(&mut self, name: impl Into<String>, handler: ActionHandler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn register_defaults(&mut self) {
        self.register("inject_context", handler!(context_actions::inject_context));
        self.register("inject_message", handler!(context_actions::inject_message));
        self.register("capture_artifact", handler!(context_actions::capture_artifact));
        self.register("read_artifact", handler!(context_actions::read_artifact));
        self.register("load_workflow_state", handler!(context_actions::load_workflow_state));
        self.register("save_workflow_state", handler!(context_actions::save_workflow_state));
        self.register("set_variable", handler!(context_actions::set_variable));
        self.register("increment_variable", handler!(context_actions::increment_variable));
        self.register("restore_context", handler!(context_actions::restore_context));
        self.register("switch_mode", handler!(context_actions::switch_mode));
        self.register("mark_loop_complete", handler!(context_actions::mark_loop_complete));

        self.register("call_llm", handler!(llm_actions::call_llm));
        self.register("synthesize_title", handler!(llm_actions::synthesize_title));
        self.register("generate_summary", handler!(llm_actions::generate_summary));
        self.register("generate_handoff", handler!(llm_actions::generate_handoff));
        self.register(
            "extract_handoff_context",
            handler!(llm_actions::extract_handoff_context),
        );

        self.register("memory_inject", handler!(memory_actions::memory_inject));
        self.register("memory_extract", handler!(memory_actions::memory_extract));
        self.register("skills_learn", handler!(memory_actions::skills_learn));
        self.register("memory.sync_import", handler!(memory_actions::memory_sync_import));
        self.register("memory.sync_export", handler!(memory_actions::memory_sync_export));

        self.register("write_todos", handler!(task_actions::write_todos));
        self.register("mark_todo_complete", handler!(task_actions::mark_todo_complete));
        self.register("persist_tasks", handler!(task_actions::persist_tasks));
        self.register("call_mcp_tool", handler!(task_actions::call_mcp_tool));
        self.register("mark_session_status", handler!(task_actions::mark_session_status));
        self.register("start_new_session", handler!(task_actions::start_new_session));
    }

    /// Execute an action by name.
    ///
    /// Unknown actions and handler errors never propagate: they are logged
    /// and folded into an `error` variable so the rest of the trigger list
    /// still runs.
    pub async fn execute(
        &self,
        action_type: &str,
        context: &ActionContext,
        args: &ActionDef,
    ) -> ActionOutput {
        let Some(handler) = self.handlers.get(action_type) else {
            warn!(action = action_type, "unknown action type");
            return ActionOutput::Empty;
        };

        match handler(context.clone(), args.clone()).await {
            Ok(output) => output,
            Err(e) => {
                error!(action = action_type, error = %e, "action execution failed");
                ActionOutput::var("error", Value::String(e.0))
            }
        }
    }
}

pub(crate) fn arg_str<'a>(args: &'a ActionDef, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn context_with(services: Services) -> ActionContext {
        let state = WorkflowState::new("sess-1", "wf", "start");
        ActionContext::new("sess-1", state, Arc::new(services))
    }

    pub fn bare_context() -> ActionContext {
        context_with(Services::default())
    }

    pub fn args(value: serde_json::Value) -> ActionDef {
        value.as_object().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_support::{args, bare_context};

    #[tokio::test]
    async fn test_unknown_action_is_empty() {
        let executor = ActionExecutor::new(Arc::new(Services::default()));
        let output = executor
            .execute("does_not_exist", &bare_context(), &args(json!({})))
            .await;
        assert!(matches!(output, ActionOutput::Empty));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_var() {
        let executor = ActionExecutor::new(Arc::new(Services::default()));
        // call_llm without an LLM service errors internally
        let output = executor
            .execute(
                "call_llm",
                &bare_context(),
                &args(json!({"prompt": "hi", "output_as": "x"})),
            )
            .await;
        match output {
            ActionOutput::Vars(vars) => assert!(vars.contains_key("error")),
            other => panic!("expected Vars with error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_registration() {
        let mut executor = ActionExecutor::new(Arc::new(Services::default()));
        executor.register(
            "shout",
            Arc::new(|_ctx, args| {
                Box::pin(async move {
                    let text = arg_str(&args, "text").unwrap_or("").to_uppercase();
                    Ok(ActionOutput::Message(text))
                }) as ActionFuture
            }),
        );
        let output = executor
            .execute("shout", &bare_context(), &args(json!({"text": "hey"})))
            .await;
        assert!(matches!(output, ActionOutput::Message(m) if m == "HEY"));
    }

    #[test]
    fn test_effects_fold() {
        let mut effects = ActionEffects::default();
        effects.absorb(ActionOutput::Inject("ctx-a".into()));
        effects.absorb(ActionOutput::System("first".into()));
        effects.absorb(ActionOutput::Multi(vec![
            ActionOutput::Message("msg".into()),
            ActionOutput::System("second".into()),
            ActionOutput::var("k", json!(1)),
        ]));

        assert_eq!(effects.injected_context, vec!["ctx-a"]);
        assert_eq!(effects.injected_messages, vec!["msg"]);
        // last system message wins
        assert_eq!(effects.system_message.as_deref(), Some("second"));
        assert_eq!(effects.vars["k"], json!(1));
        assert!(effects.block_reason.is_none());
    }

    #[test]
    fn test_effects_first_block_wins() {
        let mut effects = ActionEffects::default();
        effects.absorb(ActionOutput::Block { reason: "first".into() });
        effects.absorb(ActionOutput::Block { reason: "second".into() });
        assert_eq!(effects.block_reason.as_deref(), Some("first"));
    }
}

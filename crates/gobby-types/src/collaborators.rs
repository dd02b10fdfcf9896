//! Collaborator traits consumed by workflow actions.
//!
//! The workflow engine talks to the rest of the daemon (sessions, tasks, the
//! MCP proxy, LLM providers, memory) exclusively through these object-safe
//! traits, keeping the engine decoupled from their implementations. Each
//! trait is consumed as an `Arc<dyn ...>` handle on the action context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::events::HookEvent;

/// Error type for collaborator calls. Collaborators are external systems, so
/// the engine only needs a message to log.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type CollabResult<T> = Result<T, CollaboratorError>;

// ── Sessions ────────────────────────────────────────────────────────────

/// A session row as seen by actions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionRecord {
    pub id: String,
    pub external_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub project_id: Option<String>,
    pub status: String,
    pub title: Option<String>,
    pub summary_markdown: Option<String>,
    pub compact_markdown: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub source: Option<String>,
    pub git_branch: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Option<SessionRecord>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
        machine_id: &str,
        project_id: &str,
        source: &str,
    ) -> Option<SessionRecord>;

    async fn update_status(&self, session_id: &str, status: &str) -> CollabResult<()>;
    async fn update_summary(&self, session_id: &str, markdown: &str) -> CollabResult<()>;
    async fn update_title(&self, session_id: &str, title: &str) -> CollabResult<()>;
    async fn update_compact_markdown(&self, session_id: &str, markdown: &str) -> CollabResult<()>;
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskRecord {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: String,
    pub commits: Vec<String>,
}

/// Fields for a task created by the `persist_tasks` action.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewTask {
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: i64,
    pub task_type: String,
    pub labels: Vec<String>,
    pub discovered_in_session_id: Option<String>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Resolve a task by id or ref (`#123` style refs resolve to UUID ids).
    async fn get_task(&self, task_ref: &str) -> Option<TaskRecord>;

    async fn create_task(&self, task: NewTask) -> CollabResult<TaskRecord>;

    /// Link a task to a session (`worked_on`, ...).
    async fn link_task(&self, session_id: &str, task_id: &str, relation: &str) -> CollabResult<()>;
}

/// Synchronous task predicates exposed to the expression evaluator.
///
/// Kept separate from [`TaskStore`] because condition evaluation is
/// synchronous; implementations answer from a local store or cache.
pub trait TaskConditions: Send + Sync {
    /// Whether the task and all its descendants are closed.
    fn task_tree_complete(&self, task_id: &str) -> bool;

    /// Whether the task is awaiting user review.
    fn task_needs_user_review(&self, task_id: &str) -> bool;

    /// Whether the task has linked commits.
    fn task_has_commits(&self, task_id: &str) -> bool {
        let _ = task_id;
        false
    }
}

// ── MCP tool proxy ──────────────────────────────────────────────────────

#[async_trait]
pub trait ToolProxy: Send + Sync {
    /// Proxy a tool call to a connected MCP server.
    async fn call_tool(&self, server: &str, tool: &str, args: Value) -> CollabResult<Value>;

    fn is_connected(&self, server: &str) -> bool;
}

// ── LLM ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_text(&self, prompt: &str, model: Option<&str>) -> CollabResult<String>;

    /// Render `prompt_template` against `context` and generate a summary.
    async fn generate_summary(
        &self,
        context: &Map<String, Value>,
        prompt_template: &str,
    ) -> CollabResult<String>;
}

pub trait LlmService: Send + Sync {
    fn default_provider(&self) -> Option<Arc<dyn LlmProvider>>;

    /// Provider + model override for a named feature (e.g. "memory").
    fn provider_for_feature(&self, feature: &str) -> Option<(Arc<dyn LlmProvider>, Option<String>)>;
}

// ── Memory ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub memory_type: String,
    pub importance: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub memory_type: String,
    pub importance: f64,
    pub project_id: String,
    pub source_type: String,
    pub source_session_id: Option<String>,
    pub tags: Vec<String>,
}

/// Memory feature configuration exposed to actions.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub auto_extract: bool,
    pub extraction_prompt: String,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn config(&self) -> MemoryConfig;

    async fn recall(&self, project_id: &str, min_importance: f64) -> Vec<MemoryRecord>;
    async fn remember(&self, memory: NewMemory) -> CollabResult<MemoryRecord>;
    async fn content_exists(&self, content: &str, project_id: &str) -> bool;
}

/// Filesystem round-trip for memories.
#[async_trait]
pub trait MemorySync: Send + Sync {
    async fn import_from_files(&self) -> CollabResult<usize>;
    async fn export_to_files(&self) -> CollabResult<usize>;
}

// ── Stop signals ────────────────────────────────────────────────────────

pub trait StopRegistry: Send + Sync {
    fn has_pending_signal(&self, session_id: &str) -> bool;
}

// ── Skills ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait SkillLearner: Send + Sync {
    fn enabled(&self) -> bool;

    /// Learn skills from a finished session; returns new skill names.
    async fn learn_from_session(&self, session: &SessionRecord) -> CollabResult<Vec<String>>;
}

// ── Agent workflow source ───────────────────────────────────────────────

/// Resolution result for a qualified workflow name (`agent:workflow`).
#[derive(Debug, Clone)]
pub enum WorkflowSpec {
    /// The agent YAML points at a workflow file (name without extension).
    FileReference(String),
    /// The agent YAML embeds the workflow definition inline.
    Inline(Map<String, Value>),
}

/// Resolves inline workflows declared in agent definitions. The loader asks
/// this before falling back to disk for names containing `:`.
pub trait AgentWorkflowSource: Send + Sync {
    fn inline_workflow(&self, agent: &str, workflow: &str) -> Option<WorkflowSpec>;
}

// ── Behaviors ───────────────────────────────────────────────────────────

/// An observer behavior invoked with the event and mutable state variables.
///
/// Behaviors mutate variables through the map passed to them; the engine
/// routes the resulting diff through the atomic state merge.
#[async_trait]
pub trait Behavior: Send + Sync {
    async fn run(
        &self,
        event: &HookEvent,
        variables: &mut Map<String, Value>,
    ) -> CollabResult<()>;
}

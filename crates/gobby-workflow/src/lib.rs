//! Workflow engine for the Gobby daemon.
//!
//! Gobby sits between an AI coding assistant and its tools. This crate is
//! the core of that mediation: it loads declarative YAML workflow
//! definitions, consumes hook events, evaluates trigger and rule conditions
//! through a safe AST-based expression evaluator, decides whether to allow,
//! block, or modify tool calls, runs side-effecting actions, and drives
//! step-to-step transitions with per-session persisted state.

pub mod actions;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod loader;
pub mod observers;
pub mod template;

pub use actions::{
    ActionConfig, ActionContext, ActionEffects, ActionError, ActionExecutor, ActionHandler,
    ActionOutput, ActionResult, Services,
};
pub use definitions::{
    ActionDef, AnyDefinition, ExitCondition, ExitConditionKind, Observer, PipelineDefinition,
    PipelineStep, PrematureStopAction, PrematureStopHandler, RuleAction, RuleDefinition,
    ToolFilter, WorkflowDefinition, WorkflowRule, WorkflowStep, WorkflowTransition,
};
pub use engine::{
    ActivationResult, ApprovalResponse, EngineConfig, TransitionResult, WorkflowEngine,
    check_approval_response,
};
pub use error::{Result, WorkflowError};
pub use expr::{ConditionEvaluator, HelperFn, HelperTable, LazyBool, Value};
pub use hooks::WorkflowHookHandler;
pub use loader::{DiscoveredWorkflow, WorkflowLoader};
pub use observers::{BehaviorRegistry, ObserverEngine};
pub use template::TemplateEngine;

//! Shared types for the Gobby daemon.
//!
//! This crate defines the hook event model exchanged with assistant
//! transports, the collaborator traits the workflow engine consumes as typed
//! handles, and the injected clock used for time-dependent logic.

pub mod clock;
pub mod collaborators;
pub mod events;

pub use clock::{Clock, SharedClock, SystemClock};
pub use collaborators::{
    AgentWorkflowSource, Behavior, CollabResult, CollaboratorError, LlmProvider, LlmService,
    MemoryConfig, MemoryRecord, MemoryStore, MemorySync, NewMemory, NewTask, SessionRecord,
    SessionStore, SkillLearner, StopRegistry, TaskConditions, TaskRecord, TaskStore, ToolProxy,
    WorkflowSpec,
};
pub use events::{Decision, HookEvent, HookEventType, HookResponse};

//! SQLite persistence for Gobby.
//!
//! Holds the workflow runtime state rows plus the tiered rule store, session
//! variable key-value store, and the workflow audit log. All mutators that
//! touch the variables JSON run inside `BEGIN IMMEDIATE` transactions so
//! concurrent hook evaluations for one session cannot lose updates.

pub mod audit;
pub mod database;
pub mod error;
pub mod instances;
pub mod rules;
pub mod session_vars;
pub mod state;

pub use audit::WorkflowAuditManager;
pub use database::Database;
pub use error::{Result, StorageError};
pub use instances::{WorkflowInstance, WorkflowInstanceManager};
pub use rules::{RuleStore, RuleTier, StoredRule};
pub use session_vars::SessionVariableStore;
pub use state::{ListUpdate, WorkflowState, WorkflowStateManager};

/// Sentinel workflow name for a state row holding lifecycle variables only.
pub const LIFECYCLE_WORKFLOW: &str = "__lifecycle__";

/// Sentinel workflow name for a cleared step workflow whose lifecycle
/// variables persist.
pub const ENDED_WORKFLOW: &str = "__ended__";

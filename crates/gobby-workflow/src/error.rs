//! Error types for the workflow engine.

use thiserror::Error;

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that can occur while loading or running workflows.
///
/// Configuration errors (cycles, missing imports, invalid references, bad
/// observer variants) surface to the loader's caller. Everything the engine
/// hits at event time is degraded to an allow-with-logs or a block decision
/// instead of propagating.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Circular workflow inheritance detected: {chain}")]
    CircularInheritance { chain: String },

    #[error("Imported rule file '{0}' not found. Searched project, user, and bundled rule directories.")]
    ImportNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow '{name}': {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("Invalid pipeline reference: {0}")]
    InvalidPipelineReference(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template render error: {0}")]
    Template(String),

    #[error("Storage error: {0}")]
    Storage(#[from] gobby_storage::StorageError),
}

impl WorkflowError {
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::InvalidDefinition {
            name: name.into(),
            message: message.into(),
        }
    }
}

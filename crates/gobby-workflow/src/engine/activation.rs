//! On-demand workflow activation.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::{info, warn};

use gobby_storage::WorkflowState;

use crate::definitions::AnyDefinition;
use crate::engine::WorkflowEngine;

/// Outcome of an activation attempt.
#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub success: bool,
    pub error: Option<String>,
    pub workflow: Option<String>,
    pub step: Option<String>,
    pub steps: Vec<String>,
    pub variables: Map<String, Value>,
}

impl ActivationResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            workflow: None,
            step: None,
            steps: Vec::new(),
            variables: Map::new(),
        }
    }
}

impl WorkflowEngine {
    /// Activate a step workflow for a session, initializing its state at
    /// the first step.
    ///
    /// Always-on workflows cannot be activated (they already run on every
    /// event), pipelines are not step workflows, and a session that already
    /// runs a step workflow keeps it.
    pub async fn activate_workflow(
        &self,
        workflow_name: &str,
        session_id: &str,
        project_path: Option<&Path>,
        variables: Option<Map<String, Value>>,
    ) -> ActivationResult {
        let definition = match self.loader.load_workflow(workflow_name, project_path).await {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                warn!(workflow = workflow_name, "workflow not found for activation");
                return ActivationResult::failure(format!("Workflow '{workflow_name}' not found"));
            }
            Err(e) => {
                return ActivationResult::failure(format!(
                    "Failed to load workflow '{workflow_name}': {e}"
                ));
            }
        };

        let workflow = match &definition {
            AnyDefinition::Workflow(workflow) => workflow.clone(),
            AnyDefinition::Pipeline(_) => {
                return ActivationResult::failure(format!(
                    "'{workflow_name}' is a pipeline. Use pipeline execution instead."
                ));
            }
        };

        if workflow.enabled {
            return ActivationResult::failure(format!(
                "Workflow '{workflow_name}' is always-on (auto-runs on events) and cannot be activated"
            ));
        }

        // An existing step workflow keeps the session.
        let existing = self.state_manager.get_state(session_id).ok().flatten();
        if let Some(existing_state) = &existing {
            if !existing_state.is_sentinel() {
                let existing_def = self
                    .loader
                    .load_workflow(&existing_state.workflow_name, project_path)
                    .await
                    .ok()
                    .flatten();
                let existing_always_on = existing_def
                    .as_ref()
                    .and_then(AnyDefinition::as_workflow)
                    .map(|w| w.enabled)
                    .unwrap_or(false);
                if !existing_always_on {
                    warn!(
                        session_id,
                        active = %existing_state.workflow_name,
                        "session already has an active step workflow"
                    );
                    return ActivationResult::failure(format!(
                        "Session already has workflow '{}' active",
                        existing_state.workflow_name
                    ));
                }
            }
        }

        let Some(first_step) = workflow.steps.first() else {
            return ActivationResult::failure(format!(
                "Workflow '{workflow_name}' has no steps defined"
            ));
        };

        // Variable precedence: existing lifecycle variables < workflow
        // defaults < caller-provided values.
        let mut merged = existing
            .as_ref()
            .map(|state| state.variables.clone())
            .unwrap_or_default();
        for (key, value) in &workflow.variables {
            merged.insert(key.clone(), value.clone());
        }
        if let Some(provided) = variables {
            for (key, value) in provided {
                merged.insert(key, value);
            }
        }

        let mut state = WorkflowState::new(session_id, workflow_name, &first_step.name);
        state.step_entered_at = Some(self.clock.now());
        state.variables = merged.clone();

        if let Err(e) = self.state_manager.save_state(&state) {
            return ActivationResult::failure(format!("Failed to persist workflow state: {e}"));
        }
        info!(workflow = workflow_name, session_id, "activated workflow");

        ActivationResult {
            success: true,
            error: None,
            workflow: Some(workflow_name.to_string()),
            step: Some(first_step.name.clone()),
            steps: workflow.steps.iter().map(|s| s.name.clone()).collect(),
            variables: merged,
        }
    }
}

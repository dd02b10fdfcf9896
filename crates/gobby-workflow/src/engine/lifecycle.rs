//! Lifecycle (always-on) workflow evaluation.
//!
//! Every hook event sweeps the discovered always-on workflows in order
//! (project first, then priority, then name). Triggers fire at most once per
//! `(workflow, trigger)` across sweep iterations, actions thread a shared
//! `context_data` map forward, and observers run once per workflow after the
//! triggers. State mutations persist through `save_state` for fresh rows and
//! the atomic variable merge for existing ones.

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use gobby_storage::WorkflowState;
use gobby_types::{Decision, HookEvent, HookEventType, HookResponse};

use crate::actions::{ActionContext, ActionEffects};
use crate::definitions::{PrematureStopAction, WorkflowDefinition};
use crate::engine::context::{build_eval_context, evaluate_block_rule};
use crate::engine::{WorkflowEngine, detection};
use crate::expr::build_condition_helpers;

/// Key carrying agent-authoritative session variables through the shared
/// context. Applied after the state merge so they win.
pub(crate) const SESSION_VARS_OVERRIDE: &str = "_session_variables_override";

/// Variables inherited from a parent session on SESSION_START. Currently
/// none are inherited by default.
const VARS_TO_INHERIT: [&str; 0] = [];

/// Legacy trigger-name aliases.
fn trigger_aliases(trigger_key: &str) -> &'static [&'static str] {
    match trigger_key {
        "on_before_agent" => &["on_prompt_submit"],
        "on_before_tool" => &["on_tool_call"],
        "on_after_tool" => &["on_tool_result"],
        _ => &[],
    }
}

fn variable_diff(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl WorkflowEngine {
    /// Discover and evaluate all lifecycle workflows for an event, merging
    /// their responses: contexts accumulate joined by blank lines, the last
    /// system message wins, the first non-allow decision wins, and a block
    /// stops the sweep.
    pub async fn evaluate_all_lifecycle_workflows(
        &self,
        event: &HookEvent,
        context_data: Option<Map<String, Value>>,
    ) -> HookResponse {
        let project_path = event.project_path();
        let discovered = self.loader.discover_workflows(project_path.as_deref()).await;
        if discovered.is_empty() {
            debug!("no workflows discovered");
            return HookResponse::allow();
        }

        // Lifecycle evaluation concerns enabled step/lifecycle workflows
        // matching the event source; pipelines and on-demand workflows are
        // skipped. The sweep's tail work (detection, premature stop) still
        // runs even when the filtered list is empty.
        let workflows: Vec<_> = discovered
            .into_iter()
            .filter_map(|entry| {
                let workflow = entry.definition.as_workflow()?.clone();
                if !workflow.enabled {
                    return None;
                }
                if let (Some(source), Some(sources)) = (&event.source, &workflow.sources) {
                    if !sources.iter().any(|s| s == source) {
                        return None;
                    }
                }
                Some((entry.name, workflow))
            })
            .collect();

        debug!(
            count = workflows.len(),
            names = ?workflows.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            "evaluating lifecycle workflows"
        );

        let mut context_data = context_data.unwrap_or_default();
        let session_id = event.session_id().map(str::to_string);

        // Preload session-scoped variables so conditions like
        // `task_claimed` work across hook calls.
        if let Some(session_id) = &session_id {
            if let Ok(Some(state)) = self.state_manager.get_state(session_id) {
                for (key, value) in &state.variables {
                    context_data.insert(key.clone(), value.clone());
                }
            }

            // The agent-facing variable store is authoritative over workflow
            // state; stash it so the per-workflow merge can re-apply it on
            // top.
            match self.session_vars.get_variables(session_id) {
                Ok(session_vars) if !session_vars.is_empty() => {
                    for (key, value) in &session_vars {
                        context_data.insert(key.clone(), value.clone());
                    }
                    context_data.insert(SESSION_VARS_OVERRIDE.into(), Value::Object(session_vars));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "could not load session variables"),
            }

            // Fresh sessions may inherit selected variables from a parent.
            if event.event_type == HookEventType::SessionStart {
                if let Some(parent_id) = event.parent_session_id() {
                    if let Ok(Some(parent_state)) = self.state_manager.get_state(parent_id) {
                        let inherited: Map<String, Value> = parent_state
                            .variables
                            .iter()
                            .filter(|(key, _)| VARS_TO_INHERIT.contains(&key.as_str()))
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect();
                        if !inherited.is_empty() {
                            info!(parent_id, ?inherited, "inherited variables from parent session");
                            for (key, value) in inherited {
                                context_data.insert(key, value);
                            }
                        }
                    }
                }
            }
        }

        let mut all_context: Vec<String> = Vec::new();
        let mut final_decision = Decision::Allow;
        let mut final_reason: Option<String> = None;
        let mut final_system_message: Option<String> = None;

        let trigger_key = event.event_type.trigger_key();
        let mut processed: std::collections::HashSet<(String, &str)> =
            std::collections::HashSet::new();

        for iteration in 0..self.config.max_trigger_iterations {
            let mut triggers_fired = false;

            for (name, workflow) in &workflows {
                let key = (workflow.name.clone(), trigger_key);
                if processed.contains(&key) {
                    continue;
                }

                // Workflow YAML defaults merge under session state.
                for (var_name, default) in &workflow.variables {
                    context_data
                        .entry(var_name.clone())
                        .or_insert_with(|| default.clone());
                }

                let response = self
                    .evaluate_workflow_triggers_inner(workflow, event, &mut context_data)
                    .await;

                if let Some(context) = &response.context {
                    all_context.push(context.clone());
                    triggers_fired = true;
                    processed.insert(key);
                }
                if response.system_message.is_some() {
                    final_system_message = response.system_message.clone();
                }
                if response.decision != Decision::Allow && final_decision == Decision::Allow {
                    final_decision = response.decision;
                    final_reason = response.reason.clone();
                }
                if response.decision == Decision::Block {
                    info!(workflow = %name, reason = ?response.reason, "workflow blocked event");
                    return HookResponse {
                        decision: Decision::Block,
                        reason: response.reason,
                        context: join_context(&all_context),
                        system_message: final_system_message,
                        metadata: None,
                    };
                }
            }

            if !triggers_fired {
                debug!(iteration = iteration + 1, "no triggers fired, stopping sweep");
                break;
            }
        }

        // Observers run once per workflow, after all triggers.
        if let Some(session_id) = &session_id {
            for (_, workflow) in &workflows {
                if workflow.observers.is_empty() {
                    continue;
                }
                self.run_workflow_observers(workflow, event, session_id).await;
            }
        }

        // Detection helpers also run for sessions without a step workflow,
        // against the lifecycle sentinel row, so session-scoped enforcement
        // (task claims, plan mode, MCP tracking) works from lifecycle
        // workflows alone.
        if let Some(session_id) = &session_id {
            match event.event_type {
                HookEventType::AfterTool => self.run_lifecycle_detection(event, session_id).await,
                HookEventType::BeforeAgent => {
                    self.run_lifecycle_plan_mode_detection(event, session_id)
                }
                _ => {}
            }
        }

        // STOP events check the active step workflow for premature stops.
        if event.event_type == HookEventType::Stop {
            if let Some(premature) = self.check_premature_stop(event).await {
                if let Some(context) = &premature.context {
                    all_context.push(context.clone());
                }
                if premature.decision != Decision::Allow {
                    final_decision = premature.decision;
                    final_reason = premature.reason;
                }
            }
        }

        let mut metadata = Map::new();
        metadata.insert(
            "workflow_variables".into(),
            Value::Object(context_data.clone()),
        );

        HookResponse {
            decision: final_decision,
            reason: final_reason,
            context: join_context(&all_context),
            system_message: final_system_message,
            metadata: Some(metadata),
        }
    }

    /// Evaluate one named workflow's triggers without step state (e.g.
    /// session-handoff flows invoked directly by the transport).
    pub async fn evaluate_lifecycle_triggers(
        &self,
        workflow_name: &str,
        event: &HookEvent,
        context_data: Option<Map<String, Value>>,
    ) -> HookResponse {
        let project_path = event.project_path();
        let loaded = match self.loader.load_workflow(workflow_name, project_path.as_deref()).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                warn!(workflow = workflow_name, "workflow not found");
                return HookResponse::allow();
            }
            Err(e) => {
                error!(workflow = workflow_name, error = %e, "failed to load workflow");
                return HookResponse::allow();
            }
        };
        let Some(workflow) = loaded.as_workflow().cloned() else {
            debug!(workflow = workflow_name, "not a step/lifecycle workflow, skipping triggers");
            return HookResponse::allow();
        };

        let mut context_data = context_data.unwrap_or_default();
        self.evaluate_workflow_triggers_inner(&workflow, event, &mut context_data)
            .await
    }

    /// Evaluate triggers for a single workflow, threading `context_data`.
    async fn evaluate_workflow_triggers_inner(
        &self,
        workflow: &std::sync::Arc<WorkflowDefinition>,
        event: &HookEvent,
        context_data: &mut Map<String, Value>,
    ) -> HookResponse {
        let trigger_key = event.event_type.trigger_key();

        let mut triggers = workflow.trigger_actions(trigger_key);
        if triggers.is_empty() {
            for alias in trigger_aliases(trigger_key) {
                triggers = workflow.trigger_actions(alias);
                if !triggers.is_empty() {
                    debug!(alias, trigger_key, "using legacy trigger alias");
                    break;
                }
            }
        }
        let triggers: Vec<Map<String, Value>> = triggers.into_iter().cloned().collect();

        let has_tool_rules =
            event.event_type == HookEventType::BeforeTool && !workflow.tool_rules.is_empty();
        if triggers.is_empty() && !has_tool_rules {
            return HookResponse::allow();
        }

        debug!(
            workflow = %workflow.name,
            trigger_key,
            trigger_count = triggers.len(),
            "evaluating workflow triggers"
        );

        // State persists action side effects (injected memory ids, unlocked
        // tools) across hook calls. The synthetic "global" session never
        // persists.
        let session_id = event
            .session_id()
            .map(str::to_string)
            .unwrap_or_else(|| "global".to_string());
        let existing = self.state_manager.get_state(&session_id).ok().flatten();
        let state_was_created = existing.is_none();
        let mut state = existing.unwrap_or_else(|| {
            let mut fresh = WorkflowState::lifecycle(&session_id);
            fresh.workflow_name = workflow.name.clone();
            fresh.step = "global".to_string();
            fresh
        });
        let vars_snapshot = if state_was_created {
            None
        } else {
            Some(state.variables.clone())
        };

        // Merge precedence: context defaults < persisted state < session
        // variable overrides.
        if !context_data.is_empty() {
            let mut merged = context_data.clone();
            for (key, value) in &state.variables {
                merged.insert(key.clone(), value.clone());
            }
            state.variables = merged;
        }
        if let Some(Value::Object(overrides)) = context_data.get(SESSION_VARS_OVERRIDE) {
            for (key, value) in overrides {
                state.variables.insert(key.clone(), value.clone());
            }
        }

        let ctx = self.action_context(&session_id, state, event);

        // Top-level tool_rules run before trigger actions.
        if has_tool_rules {
            let state_snapshot = ctx.state.lock().clone();
            let session_info = self.session_info(&session_id).await;
            let eval_ctx = build_eval_context(event, &state_snapshot, session_info.as_ref(), None);
            let helper_sources = self.helper_sources();
            for rule in &workflow.tool_rules {
                if let Some(reason) =
                    evaluate_block_rule(rule, event, &eval_ctx, &self.evaluator, &helper_sources)
                {
                    self.persist_lifecycle_state(&ctx, state_was_created, &vars_snapshot, Some(workflow));
                    return HookResponse::block(reason);
                }
            }
        }

        let session_info = self.session_info(&session_id).await;
        let task_has_commits = self.task_has_commits(&ctx).await;

        let mut effects = ActionEffects::default();

        for trigger in &triggers {
            if let Some(when) = trigger.get("when").and_then(Value::as_str) {
                let state_snapshot = ctx.state.lock().clone();
                let mut eval_ctx =
                    build_eval_context(event, &state_snapshot, session_info.as_ref(), None);
                eval_ctx.insert("handoff".into(), Value::Object(context_data.clone()));
                eval_ctx.insert("task_has_commits".into(), Value::Bool(task_has_commits));
                for (key, value) in context_data.iter() {
                    eval_ctx.entry(key.clone()).or_insert_with(|| value.clone());
                }
                let helpers =
                    build_condition_helpers(&self.helper_sources(), &state_snapshot.variables);
                let fired = self.evaluator.evaluate_with_helpers(when, &eval_ctx, &helpers);
                debug!(condition = when, fired, workflow = %workflow.name, "trigger condition");
                if !fired {
                    continue;
                }
            }

            let Some(action_type) = trigger.get("action").and_then(Value::as_str) else {
                continue;
            };

            let mut kwargs = trigger.clone();
            kwargs.remove("action");
            kwargs.remove("when");

            debug!(action = action_type, workflow = %workflow.name, "executing trigger action");
            let output = self.actions.execute(action_type, &ctx, &kwargs).await;

            let mut single = ActionEffects::default();
            single.absorb(output);

            // Variable results chain into shared context and state.
            for (key, value) in &single.vars {
                context_data.insert(key.clone(), value.clone());
                ctx.state.lock().variables.insert(key.clone(), value.clone());
            }
            effects.injected_context.extend(single.injected_context);
            effects.injected_messages.extend(single.injected_messages);
            if single.system_message.is_some() {
                effects.system_message = single.system_message;
            }

            if let Some(reason) = single.block_reason {
                self.persist_lifecycle_state(&ctx, state_was_created, &vars_snapshot, Some(workflow));
                return HookResponse {
                    decision: Decision::Block,
                    reason: Some(reason),
                    context: join_context(&effects.all_injected()),
                    system_message: effects.system_message,
                    metadata: None,
                };
            }
        }

        self.persist_lifecycle_state(&ctx, state_was_created, &vars_snapshot, Some(workflow));

        HookResponse {
            decision: Decision::Allow,
            reason: None,
            context: join_context(&effects.all_injected()),
            system_message: effects.system_message,
            metadata: None,
        }
    }

    /// AFTER_TOOL detection against the session's state row (created as a
    /// lifecycle sentinel when absent).
    async fn run_lifecycle_detection(&self, event: &HookEvent, session_id: &str) {
        let existing = self.state_manager.get_state(session_id).ok().flatten();
        let state_was_created = existing.is_none();
        let mut state = existing.unwrap_or_else(|| WorkflowState::lifecycle(session_id));
        let vars_snapshot = if state_was_created {
            None
        } else {
            Some(state.variables.clone())
        };

        let tasks = self.actions.services.tasks.clone();
        detection::detect_plan_mode(event, &mut state);
        detection::detect_task_claim(event, &mut state, tasks.as_ref()).await;
        detection::detect_mcp_call(event, &mut state);

        self.persist_detection_state(session_id, state, state_was_created, vars_snapshot);
    }

    /// BEFORE_AGENT detection: plan-mode system reminders in the prompt.
    fn run_lifecycle_plan_mode_detection(&self, event: &HookEvent, session_id: &str) {
        let existing = self.state_manager.get_state(session_id).ok().flatten();
        let state_was_created = existing.is_none();
        let mut state = existing.unwrap_or_else(|| WorkflowState::lifecycle(session_id));
        let vars_snapshot = if state_was_created {
            None
        } else {
            Some(state.variables.clone())
        };

        detection::detect_plan_mode_from_context(event, &mut state);
        self.persist_detection_state(session_id, state, state_was_created, vars_snapshot);
    }

    fn persist_detection_state(
        &self,
        session_id: &str,
        state: WorkflowState,
        state_was_created: bool,
        vars_snapshot: Option<Map<String, Value>>,
    ) {
        if state_was_created {
            if !state.variables.is_empty() {
                if let Err(e) = self.state_manager.save_state(&state) {
                    error!(session_id, error = %e, "failed to save detection state");
                }
            }
            return;
        }
        let Some(snapshot) = vars_snapshot else {
            return;
        };
        let diff = variable_diff(&snapshot, &state.variables);
        if !diff.is_empty() {
            if let Err(e) = self.state_manager.merge_variables(session_id, &diff) {
                error!(session_id, error = %e, "failed to merge detection variables");
            }
        }
    }

    async fn run_workflow_observers(
        &self,
        workflow: &std::sync::Arc<WorkflowDefinition>,
        event: &HookEvent,
        session_id: &str,
    ) {
        let existing = self.state_manager.get_state(session_id).ok().flatten();
        let state_was_created = existing.is_none();
        let mut state = existing.unwrap_or_else(|| {
            let mut fresh = WorkflowState::lifecycle(session_id);
            fresh.workflow_name = workflow.name.clone();
            fresh
        });
        let vars_snapshot = if state_was_created {
            None
        } else {
            Some(state.variables.clone())
        };

        let mut variables = state.variables.clone();
        self.observers
            .evaluate_observers(&workflow.observers, event, &mut variables)
            .await;
        state.variables = variables;

        if state_was_created {
            if let Err(e) = self.state_manager.save_state(&state) {
                error!(session_id, error = %e, "failed to save observer state");
            }
            return;
        }
        let Some(snapshot) = vars_snapshot else {
            return;
        };
        let diff = variable_diff(&snapshot, &state.variables);
        if !diff.is_empty() {
            if let Err(e) = self.state_manager.merge_variables(session_id, &diff) {
                error!(session_id, error = %e, "failed to merge observer variables");
            }
        }
    }

    /// Persist lifecycle evaluation side effects: fresh rows save whole
    /// (unless a step workflow owns the row), existing rows merge the
    /// variable diff atomically.
    fn persist_lifecycle_state(
        &self,
        ctx: &ActionContext,
        state_was_created: bool,
        vars_snapshot: &Option<Map<String, Value>>,
        workflow: Option<&std::sync::Arc<WorkflowDefinition>>,
    ) {
        if ctx.session_id == "global" {
            return;
        }
        let mut state = ctx.state.lock().clone();
        state.variables.remove(SESSION_VARS_OVERRIDE);

        if state_was_created {
            // Another hook call may have created a step-workflow row in the
            // meantime; do not clobber it.
            if let Some(workflow) = workflow {
                if let Ok(Some(current)) = self.state_manager.get_state(&ctx.session_id) {
                    if !current.is_sentinel() && current.workflow_name != workflow.name {
                        return;
                    }
                }
            }
            if let Err(e) = self.state_manager.save_state(&state) {
                error!(session_id = %ctx.session_id, error = %e, "failed to save lifecycle state");
            }
            return;
        }

        let Some(snapshot) = vars_snapshot else {
            return;
        };
        let diff = variable_diff(snapshot, &state.variables);
        if diff.is_empty() {
            return;
        }
        match self.state_manager.merge_variables(&ctx.session_id, &diff) {
            Ok(true) => {}
            Ok(false) => warn!(session_id = %ctx.session_id, "merge_variables: session vanished"),
            Err(e) => error!(session_id = %ctx.session_id, error = %e, "variable merge failed"),
        }
    }

    async fn task_has_commits(&self, ctx: &ActionContext) -> bool {
        let claimed = ctx
            .variables()
            .get("claimed_task_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(task_id) = claimed else {
            return false;
        };
        if let Some(conditions) = &self.actions.services.task_conditions {
            return conditions.task_has_commits(&task_id);
        }
        if let Some(tasks) = &self.actions.services.tasks {
            return tasks
                .get_task(&task_id)
                .await
                .map(|task| !task.commits.is_empty())
                .unwrap_or(false);
        }
        false
    }

    /// On STOP, check whether the active step workflow considers the stop
    /// premature and apply its `on_premature_stop` handler.
    pub(crate) async fn check_premature_stop(&self, event: &HookEvent) -> Option<HookResponse> {
        let session_id = event.session_id()?;
        let state = self.state_manager.get_state(session_id).ok().flatten()?;
        if state.is_sentinel() {
            return None;
        }

        let loaded = self
            .loader
            .load_workflow(&state.workflow_name, event.project_path().as_deref())
            .await
            .ok()
            .flatten()?;
        let workflow = loaded.as_workflow()?.clone();
        let handler = workflow.on_premature_stop.as_ref()?;

        let helper_sources = self.helper_sources();
        let eval_ctx = build_eval_context(event, &state, None, None);
        let helpers = build_condition_helpers(&helper_sources, &state.variables);

        // The handler's condition names when stopping is fine.
        if let Some(condition) = &handler.condition {
            if self.evaluator.evaluate_with_helpers(condition, &eval_ctx, &helpers) {
                return None;
            }
        }
        // A satisfied workflow-level exit condition also permits stopping.
        if let Some(exit_condition) = &workflow.exit_condition {
            if self
                .evaluator
                .evaluate_with_helpers(exit_condition, &eval_ctx, &helpers)
            {
                return None;
            }
        }
        // So does a current step whose exit conditions are all met.
        if let Some(step) = workflow.get_step(&state.step) {
            if !step.exit_conditions.is_empty() || step.exit_when.is_some() {
                let done = crate::engine::approval::check_exit_conditions(
                    step,
                    &state,
                    &self.evaluator,
                    &helper_sources,
                );
                if done {
                    return None;
                }
            }
        }

        info!(
            session_id,
            workflow = %workflow.name,
            action = ?handler.action,
            "premature stop detected"
        );
        match handler.action {
            PrematureStopAction::Block => Some(HookResponse::block(handler.message.clone())),
            PrematureStopAction::GuideContinuation => {
                Some(HookResponse::allow().with_context(handler.message.clone()))
            }
            PrematureStopAction::Warn => {
                warn!(session_id, message = %handler.message, "premature stop");
                None
            }
        }
    }
}

fn join_context(parts: &[String]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

//! Step transitions: on_exit / on_transition / on_enter chains, status
//! messages, and bounded auto-chaining.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info};

use gobby_types::HookEvent;

use crate::actions::{ActionContext, ActionEffects};
use crate::definitions::{ActionDef, WorkflowDefinition, WorkflowTransition};
use crate::engine::WorkflowEngine;
use crate::engine::context::build_eval_context;
use crate::expr::build_condition_helpers;

/// Result of one or more chained step transitions.
#[derive(Debug, Default, Clone)]
pub struct TransitionResult {
    /// LLM-facing context collected from on_exit/on_transition/on_enter.
    pub injected_messages: Vec<String>,
    /// User-visible output (rendered status messages).
    pub system_messages: Vec<String>,
}

impl TransitionResult {
    pub fn extend(&mut self, other: TransitionResult) {
        self.injected_messages.extend(other.injected_messages);
        self.system_messages.extend(other.system_messages);
    }

    pub fn joined_context(&self) -> Option<String> {
        if self.injected_messages.is_empty() {
            None
        } else {
            Some(self.injected_messages.join("\n\n"))
        }
    }
}

impl WorkflowEngine {
    /// Execute a transition: old step's `on_exit`, the transition's
    /// `on_transition`, state update, new step's `on_enter`, then the status
    /// message render.
    ///
    /// Per-step MCP tracking is cleared on every transition so stale results
    /// from the previous step cannot satisfy conditions in the new one.
    pub async fn transition_to(
        &self,
        ctx: &ActionContext,
        new_step_name: &str,
        workflow: &Arc<WorkflowDefinition>,
        transition: Option<&WorkflowTransition>,
    ) -> TransitionResult {
        let old_step_name = ctx.state.lock().step.clone();
        let old_step = workflow.get_step(&old_step_name).cloned();
        let Some(new_step) = workflow.get_step(new_step_name).cloned() else {
            error!(step = new_step_name, "cannot transition to unknown step");
            return TransitionResult::default();
        };

        info!(
            session_id = %ctx.session_id,
            from = %old_step_name,
            to = new_step_name,
            "transitioning"
        );
        self.audit_transition(&ctx.session_id, &old_step_name, new_step_name);

        let mut result = TransitionResult::default();

        if let Some(old_step) = &old_step {
            let effects = self.execute_actions(&old_step.on_exit, ctx).await;
            result.injected_messages.extend(effects.all_injected());
        }
        if let Some(transition) = transition {
            let effects = self.execute_actions(&transition.on_transition, ctx).await;
            result.injected_messages.extend(effects.all_injected());
        }

        {
            let mut state = ctx.state.lock();
            state.step = new_step_name.to_string();
            state.step_entered_at = Some(self.clock.now());
            state.step_action_count = 0;
            state.context_injected = false;
            // Stale MCP results from the previous step must not trigger
            // transitions in the new one.
            state.variables.remove("mcp_calls");
            state.variables.remove("mcp_results");
        }
        self.persist(ctx);

        let enter_effects = self.execute_actions(&new_step.on_enter, ctx).await;
        let entered_context = enter_effects.all_injected();
        if !entered_context.is_empty() {
            ctx.state.lock().context_injected = true;
            self.persist(ctx);
        }
        result.injected_messages.extend(entered_context);

        // status_message renders after on_enter so variables set there are
        // visible to the template.
        if let Some(status_message) = &new_step.status_message {
            let render_ctx = ctx.render_context().await;
            match ctx.template.render(status_message, &render_ctx) {
                Ok(rendered) => result.system_messages.push(rendered),
                Err(e) => {
                    tracing::warn!(
                        step = new_step_name,
                        error = %e,
                        "failed to render status_message"
                    );
                }
            }
        }

        result
    }

    /// Check the current step's transitions; on the first satisfied `when`,
    /// transition and follow deterministic chains up to the configured
    /// depth. Returns `None` when no transition fired.
    pub(crate) async fn check_transitions(
        &self,
        ctx: &ActionContext,
        workflow: &Arc<WorkflowDefinition>,
        event: &HookEvent,
        session_info: Option<&Value>,
    ) -> Option<TransitionResult> {
        let helper_sources = self.helper_sources();
        let mut result: Option<TransitionResult> = None;
        let mut visited: Vec<String> = vec![ctx.state.lock().step.clone()];

        for _depth in 0..self.config.max_transition_depth {
            let state_snapshot = ctx.state.lock().clone();
            let Some(current_step) = workflow.get_step(&state_snapshot.step).cloned() else {
                break;
            };
            let eval_ctx = build_eval_context(event, &state_snapshot, session_info, None);
            let helpers = build_condition_helpers(&helper_sources, &state_snapshot.variables);

            let matched = current_step.transitions.iter().find(|transition| {
                self.evaluator
                    .evaluate_with_helpers(&transition.when, &eval_ctx, &helpers)
            });
            let Some(transition) = matched else {
                return result;
            };

            debug!(
                from = %state_snapshot.step,
                to = %transition.to,
                condition = %transition.when,
                "transition condition satisfied"
            );
            let step_result = self
                .transition_to(ctx, &transition.to, workflow, Some(transition))
                .await;
            visited.push(transition.to.clone());
            match &mut result {
                Some(acc) => acc.extend(step_result),
                None => result = Some(step_result),
            }
        }

        if result.is_some() {
            // Depth exhausted while conditions still fire: log and stop.
            let state_snapshot = ctx.state.lock().clone();
            if let Some(current_step) = workflow.get_step(&state_snapshot.step) {
                let eval_ctx = build_eval_context(event, &state_snapshot, session_info, None);
                let helpers = build_condition_helpers(&helper_sources, &state_snapshot.variables);
                let still_firing = current_step.transitions.iter().any(|transition| {
                    self.evaluator
                        .evaluate_with_helpers(&transition.when, &eval_ctx, &helpers)
                });
                if still_firing {
                    error!(
                        workflow = %workflow.name,
                        session_id = %ctx.session_id,
                        chain = %visited.join(" -> "),
                        max_depth = self.config.max_transition_depth,
                        "auto-transition chain truncated"
                    );
                }
            }
        }

        result
    }

    /// Execute an action list sequentially, honoring per-action `when`
    /// gates. Returned variable updates are applied to the shared state so
    /// later actions and transition checks observe them.
    pub(crate) async fn execute_actions(
        &self,
        actions: &[ActionDef],
        ctx: &ActionContext,
    ) -> ActionEffects {
        let mut effects = ActionEffects::default();

        for action_def in actions {
            let Some(action_type) = action_def.get("action").and_then(Value::as_str) else {
                continue;
            };

            if let Some(when) = action_def.get("when").and_then(Value::as_str) {
                let variables = ctx.variables();
                let mut eval_ctx: Map<String, Value> = Map::new();
                eval_ctx.insert("variables".into(), Value::Object(variables.clone()));
                for (key, value) in &variables {
                    eval_ctx.entry(key.clone()).or_insert_with(|| value.clone());
                }
                let helpers = build_condition_helpers(&self.helper_sources(), &variables);
                if !self.evaluator.evaluate_with_helpers(when, &eval_ctx, &helpers) {
                    debug!(action = action_type, condition = when, "skipping action, when false");
                    continue;
                }
            }

            let output = self.actions.execute(action_type, ctx, action_def).await;
            let mut single = ActionEffects::default();
            single.absorb(output);

            // Variable results flow into state for subsequent actions.
            if !single.vars.is_empty() {
                let mut state = ctx.state.lock();
                for (key, value) in &single.vars {
                    state.variables.insert(key.clone(), value.clone());
                }
            }

            effects.injected_context.extend(single.injected_context);
            effects.injected_messages.extend(single.injected_messages);
            if single.system_message.is_some() {
                effects.system_message = single.system_message;
            }
            if effects.block_reason.is_none() {
                effects.block_reason = single.block_reason;
            }
            for (key, value) in single.vars {
                effects.vars.insert(key, value);
            }
        }

        effects
    }
}

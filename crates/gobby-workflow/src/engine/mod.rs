//! The workflow engine core.
//!
//! Consumes hook events, evaluates the session's active step workflow
//! (tool enforcement, approval gates, transitions), sweeps always-on
//! lifecycle workflows, and drives actions. The engine never raises to the
//! hook transport: every failure becomes either a block decision or a
//! permissive allow with logs.

mod activation;
mod approval;
mod context;
mod detection;
mod lifecycle;
mod transitions;

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, error, info};

use gobby_storage::{
    Database, RuleStore, SessionVariableStore, WorkflowAuditManager, WorkflowState,
    WorkflowStateManager,
};
use gobby_types::{Clock, HookEvent, HookEventType, HookResponse, SharedClock, SystemClock};

use crate::actions::{ActionContext, ActionExecutor};
use crate::definitions::{WorkflowDefinition, WorkflowStep};
use crate::expr::{ConditionEvaluator, HelperSources, build_condition_helpers};
use crate::loader::WorkflowLoader;
use crate::observers::{BehaviorRegistry, ObserverEngine};

pub use activation::ActivationResult;
pub use approval::{ApprovalCheck, ApprovalResponse, check_approval_response};
pub use transitions::TransitionResult;

/// Step name the engine escapes to when a session is stuck.
const REFLECT_STEP: &str = "reflect";

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a session may sit in one step before the engine forces a
    /// transition to `reflect`.
    pub stuck_step_timeout: Duration,
    /// Cap on lifecycle trigger sweep iterations.
    pub max_trigger_iterations: usize,
    /// Cap on auto-chained transitions within one event.
    pub max_transition_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stuck_step_timeout: Duration::minutes(30),
            max_trigger_iterations: 10,
            max_transition_depth: 10,
        }
    }
}

/// Core engine for event-driven workflow evaluation.
pub struct WorkflowEngine {
    pub(crate) loader: Arc<WorkflowLoader>,
    pub(crate) state_manager: WorkflowStateManager,
    pub(crate) session_vars: SessionVariableStore,
    pub(crate) rule_store: RuleStore,
    pub(crate) audit: Option<WorkflowAuditManager>,
    pub(crate) actions: Arc<ActionExecutor>,
    pub(crate) evaluator: ConditionEvaluator,
    pub(crate) observers: ObserverEngine,
    pub(crate) clock: SharedClock,
    pub(crate) config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(loader: Arc<WorkflowLoader>, database: Database, actions: Arc<ActionExecutor>) -> Self {
        Self {
            loader,
            state_manager: WorkflowStateManager::new(database.clone()),
            session_vars: SessionVariableStore::new(database.clone()),
            rule_store: RuleStore::new(database.clone()),
            audit: Some(WorkflowAuditManager::new(database)),
            actions,
            evaluator: ConditionEvaluator::new(),
            observers: ObserverEngine::new(None),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_behavior_registry(mut self, registry: Arc<BehaviorRegistry>) -> Self {
        self.observers = ObserverEngine::new(Some(registry));
        self
    }

    pub fn with_evaluator(mut self, evaluator: ConditionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn without_audit(mut self) -> Self {
        self.audit = None;
        self
    }

    pub fn state_manager(&self) -> &WorkflowStateManager {
        &self.state_manager
    }

    pub(crate) fn helper_sources(&self) -> HelperSources {
        HelperSources {
            task_conditions: self.actions.services.task_conditions.clone(),
            stop_registry: self.actions.services.stop_registry.clone(),
        }
    }

    pub(crate) fn action_context(&self, session_id: &str, state: WorkflowState, event: &HookEvent) -> ActionContext {
        ActionContext::new(session_id, state, self.actions.services.clone())
            .with_event_data(event.data.clone())
            .with_project_path(event.project_path())
            .with_state_manager(self.state_manager.clone())
    }

    /// Session info for condition evaluation (`session.status`, ...).
    pub(crate) async fn session_info(&self, session_id: &str) -> Option<Value> {
        let sessions = self.actions.services.sessions.as_ref()?;
        let session = sessions.get(session_id).await?;
        serde_json::to_value(&session).ok()
    }

    // ── Active step workflow evaluation ─────────────────────────────────

    /// Main entry point for hook events against the session's active step
    /// workflow.
    pub async fn handle_event(&self, event: &HookEvent) -> HookResponse {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            return HookResponse::allow(); // No session, no workflow
        };

        // 1. Load state; none means nothing to enforce.
        let state = match self.state_manager.get_state(&session_id) {
            Ok(Some(state)) => state,
            Ok(None) => return HookResponse::allow(),
            Err(e) => {
                error!(session_id, error = %e, "failed to load workflow state");
                return HookResponse::allow();
            }
        };

        // 2. Sentinel rows carry lifecycle variables only.
        if state.is_sentinel() {
            debug!(session_id, "lifecycle-only state, skipping step workflow");
            return HookResponse::allow();
        }

        // 3. Escape hatch.
        if state.disabled {
            debug!(
                session_id,
                workflow = %state.workflow_name,
                reason = state.disabled_reason.as_deref().unwrap_or("no reason specified"),
                "workflow disabled"
            );
            return HookResponse::allow();
        }

        let workflow = match self
            .loader
            .load_workflow(&state.workflow_name, event.project_path().as_deref())
            .await
        {
            Ok(Some(definition)) => match definition.as_workflow() {
                Some(workflow) => workflow.clone(),
                None => return HookResponse::allow(),
            },
            Ok(None) | Err(_) => {
                error!(
                    session_id,
                    workflow = %state.workflow_name,
                    "workflow not found for active state"
                );
                return HookResponse::allow();
            }
        };

        // 4. Stuck detection: force a transition to `reflect` when present.
        if let Some(response) = self.check_stuck(&session_id, &state, &workflow, event).await {
            return response;
        }

        let Some(current_step) = workflow.get_step(&state.step).cloned() else {
            error!(session_id, step = %state.step, workflow = %workflow.name, "step not found");
            return HookResponse::allow();
        };

        let ctx = self.action_context(&session_id, state, event);

        // 6. Approval flow runs on user prompts.
        if event.event_type == HookEventType::BeforeAgent {
            detection_pass_before_agent(event, &ctx);
            if let Some(response) = self.handle_approval(&ctx, &current_step, event).await {
                self.persist(&ctx);
                return response;
            }
            // Plan-mode detection may have flipped variables.
            self.persist(&ctx);
        }

        // 7. Tool enforcement.
        if event.event_type == HookEventType::BeforeTool {
            if let Some(response) = self.enforce_tool_rules(&ctx, &workflow, &current_step, event).await {
                return response;
            }
        }

        // 8. Transitions, with bounded auto-chaining.
        let session_info = self.session_info(&session_id).await;
        let transition_result = self
            .check_transitions(&ctx, &workflow, event, session_info.as_ref())
            .await;
        if let Some(result) = transition_result {
            self.persist(&ctx);
            let context = result.joined_context();
            let mut response = HookResponse {
                decision: gobby_types::Decision::Modify,
                context,
                system_message: result.system_messages.last().cloned(),
                ..Default::default()
            };
            if response.context.is_none() {
                let step = ctx.state.lock().step.clone();
                response.context = Some(format!("Transitioning to step: {step}"));
            }
            return response;
        }

        // 10. Post-tool bookkeeping and detection helpers.
        if event.event_type == HookEventType::AfterTool {
            {
                let mut state = ctx.state.lock();
                state.step_action_count += 1;
                state.total_action_count += 1;
            }
            self.detection_pass_after_tool(event, &ctx, &current_step).await;
            self.persist(&ctx);
        }

        HookResponse::allow()
    }

    async fn check_stuck(
        &self,
        session_id: &str,
        state: &WorkflowState,
        workflow: &Arc<WorkflowDefinition>,
        event: &HookEvent,
    ) -> Option<HookResponse> {
        let entered_at = state.step_entered_at?;
        let elapsed = self.clock.now() - entered_at;
        if elapsed <= self.config.stuck_step_timeout || state.step == REFLECT_STEP {
            return None;
        }
        workflow.get_step(REFLECT_STEP)?;

        info!(
            session_id,
            step = %state.step,
            elapsed_minutes = elapsed.num_minutes(),
            "step duration limit exceeded, forcing transition to reflect"
        );
        let ctx = self.action_context(session_id, state.clone(), event);
        self.transition_to(&ctx, REFLECT_STEP, workflow, None).await;
        self.persist(&ctx);
        Some(HookResponse {
            decision: gobby_types::Decision::Modify,
            context: Some(
                "[System Alert] Step duration limit exceeded. Transitioning to 'reflect' step."
                    .to_string(),
            ),
            system_message: Some("Stuck step detected; moved to reflect".to_string()),
            ..Default::default()
        })
    }

    /// Tool enforcement for BEFORE_TOOL: approval hold, step tool filters,
    /// MCP filters, workflow tool_rules, step rules, then check_rules.
    async fn enforce_tool_rules(
        &self,
        ctx: &ActionContext,
        workflow: &Arc<WorkflowDefinition>,
        step: &WorkflowStep,
        event: &HookEvent,
    ) -> Option<HookResponse> {
        let session_id = &ctx.session_id;
        let state_snapshot = ctx.state.lock().clone();
        let step_name = state_snapshot.step.clone();
        let tool_name = event.tool_name().unwrap_or("unknown").to_string();

        if state_snapshot.approval_pending {
            let reason = "Waiting for user approval. Please respond with 'yes' or 'no'.";
            self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(reason));
            return Some(HookResponse::block(reason));
        }

        // Blocked list, then allowed list.
        if step.blocked_tools.iter().any(|blocked| blocked == &tool_name) {
            let reason = format!("Tool '{tool_name}' is blocked in step '{step_name}'.");
            self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
            return Some(HookResponse::block(reason));
        }
        if !step.allowed_tools.is_all() && !step.allowed_tools.contains(&tool_name) {
            let reason =
                format!("Tool '{tool_name}' is not in the allowed list for step '{step_name}'.");
            self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
            return Some(HookResponse::block(reason));
        }

        // MCP-level restrictions for proxied calls.
        if let Some((server, mcp_tool)) = context::mcp_identity(event) {
            if step
                .blocked_mcp_tools
                .iter()
                .any(|pattern| context::mcp_pattern_matches(pattern, &server, &mcp_tool))
            {
                let reason =
                    format!("MCP tool '{server}:{mcp_tool}' is blocked in step '{step_name}'.");
                self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
                return Some(HookResponse::block(reason));
            }
            if !step.allowed_mcp_tools.is_all() {
                let allowed = match &step.allowed_mcp_tools {
                    crate::definitions::ToolFilter::List(patterns) => patterns
                        .iter()
                        .any(|pattern| context::mcp_pattern_matches(pattern, &server, &mcp_tool)),
                    crate::definitions::ToolFilter::Keyword(kw) => kw == "all",
                };
                if !allowed {
                    let reason = format!(
                        "MCP tool '{server}:{mcp_tool}' is not in the allowed list for step '{step_name}'."
                    );
                    self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
                    return Some(HookResponse::block(reason));
                }
            }
        }

        let session_info = self.session_info(session_id).await;
        let eval_ctx =
            context::build_eval_context(event, &state_snapshot, session_info.as_ref(), None);
        let helper_sources = self.helper_sources();

        // Workflow-level tool rules share block_tools semantics.
        for rule in &workflow.tool_rules {
            if let Some(reason) =
                context::evaluate_block_rule(rule, event, &eval_ctx, &self.evaluator, &helper_sources)
            {
                self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
                return Some(HookResponse::block(reason));
            }
        }

        // Step rules: first block wins.
        for rule in &step.rules {
            let helpers = build_condition_helpers(&helper_sources, &state_snapshot.variables);
            if self
                .evaluator
                .evaluate_with_helpers(&rule.when, &eval_ctx, &helpers)
            {
                match rule.action {
                    crate::definitions::RuleAction::Block => {
                        let reason = rule
                            .message
                            .clone()
                            .unwrap_or_else(|| "Blocked by workflow rule.".to_string());
                        self.audit_rule_eval(
                            session_id,
                            &step_name,
                            rule.name.as_deref().unwrap_or("unnamed"),
                            &rule.when,
                            "block",
                            Some(&reason),
                        );
                        return Some(HookResponse::block(reason));
                    }
                    crate::definitions::RuleAction::Warn => {
                        tracing::warn!(
                            rule = rule.name.as_deref().unwrap_or("unnamed"),
                            message = rule.message.as_deref().unwrap_or(""),
                            "workflow rule warning"
                        );
                    }
                    _ => {}
                }
            }
        }

        // Named rule references resolve against the workflow, then the
        // tiered rule store.
        let resolved = context::resolve_check_rules(
            &step.check_rules,
            workflow,
            Some(&self.rule_store),
            event.project_id.as_deref(),
        );
        for rule in &resolved {
            if let Some(reason) =
                context::evaluate_block_rule(rule, event, &eval_ctx, &self.evaluator, &helper_sources)
            {
                self.audit_tool_call(session_id, &step_name, &tool_name, "block", Some(&reason));
                return Some(HookResponse::block(reason));
            }
        }

        self.audit_tool_call(session_id, &step_name, &tool_name, "allow", None);
        None
    }

    async fn detection_pass_after_tool(
        &self,
        event: &HookEvent,
        ctx: &ActionContext,
        step: &WorkflowStep,
    ) {
        let tasks = self.actions.services.tasks.clone();
        {
            let mut state = ctx.state.lock();
            detection::detect_plan_mode(event, &mut state);
        }
        {
            // Task claim resolution awaits the task store, so it works on an
            // owned copy and merges back.
            let mut state = ctx.state.lock().clone();
            detection::detect_task_claim(event, &mut state, tasks.as_ref()).await;
            *ctx.state.lock() = state;
        }

        let mcp_result = {
            let mut state = ctx.state.lock();
            detection::detect_mcp_call(event, &mut state)
        };
        if let (Some(succeeded), Some((server, tool))) = (mcp_result, context::mcp_identity(event))
        {
            let mut state = ctx.state.lock();
            detection::process_mcp_handlers(
                &mut state,
                &server,
                &tool,
                succeeded,
                &step.on_mcp_success,
                &step.on_mcp_error,
                &ctx.template,
            );
        }
    }

    /// Persist the shared state after an evaluation pass.
    pub(crate) fn persist(&self, ctx: &ActionContext) {
        let state = ctx.state.lock().clone();
        if let Err(e) = self.state_manager.save_state(&state) {
            error!(session_id = %ctx.session_id, error = %e, "failed to persist workflow state");
        }
    }

    // ── Approval flow ───────────────────────────────────────────────────

    /// Handle the approval machine on BEFORE_AGENT. Returns a response when
    /// approval handling consumed the event.
    async fn handle_approval(
        &self,
        ctx: &ActionContext,
        step: &WorkflowStep,
        event: &HookEvent,
    ) -> Option<HookResponse> {
        let now = self.clock.now();
        let state_snapshot = ctx.state.lock().clone();

        if state_snapshot.approval_pending {
            let condition_id = state_snapshot
                .approval_condition_id
                .clone()
                .unwrap_or_else(|| "approval".to_string());
            let prompt_text = state_snapshot.approval_prompt.clone().unwrap_or_default();

            // Timeout counts as rejection.
            if let Some(check) = approval::check_pending_approval(step, &state_snapshot, now) {
                if check.is_timed_out {
                    let mut state = ctx.state.lock();
                    state.variables.insert(
                        format!("_approval_{condition_id}_rejected"),
                        Value::Bool(true),
                    );
                    approval::clear_approval(&mut state);
                    drop(state);
                    self.audit_approval(&ctx.session_id, &state_snapshot.step, "timed_out", &condition_id);
                    info!(condition_id, "approval timed out");
                    return Some(HookResponse::block(format!(
                        "Approval request timed out after {} seconds.",
                        check.timeout_seconds.unwrap_or_default()
                    )));
                }
            }

            match check_approval_response(event.prompt()) {
                ApprovalResponse::Approved => {
                    let mut state = ctx.state.lock();
                    state.variables.insert(
                        format!("_approval_{condition_id}_granted"),
                        Value::Bool(true),
                    );
                    approval::clear_approval(&mut state);
                    drop(state);
                    self.audit_approval(&ctx.session_id, &state_snapshot.step, "granted", &condition_id);
                    info!(condition_id, step = %state_snapshot.step, "user approved condition");
                    Some(HookResponse::allow().with_context(format!(
                        "Approval granted for: {}",
                        if prompt_text.is_empty() { "action" } else { prompt_text.as_str() }
                    )))
                }
                ApprovalResponse::Rejected => {
                    let mut state = ctx.state.lock();
                    state.variables.insert(
                        format!("_approval_{condition_id}_rejected"),
                        Value::Bool(true),
                    );
                    approval::clear_approval(&mut state);
                    drop(state);
                    self.audit_approval(&ctx.session_id, &state_snapshot.step, "rejected", &condition_id);
                    info!(condition_id, step = %state_snapshot.step, "user rejected condition");
                    Some(HookResponse::block("User rejected the approval request."))
                }
                ApprovalResponse::Ambiguous => Some(HookResponse::allow().with_context(format!(
                    "**Waiting for approval:** {prompt_text}\n\nPlease respond with 'yes' or 'no' to continue."
                ))),
            }
        } else {
            // Request approval if an unresolved user_approval condition
            // exists.
            let check = approval::check_pending_approval(step, &state_snapshot, now)?;
            if !check.needs_approval {
                return None;
            }
            {
                let mut state = ctx.state.lock();
                state.approval_pending = true;
                state.approval_condition_id = Some(check.condition_id.clone());
                state.approval_prompt = Some(check.prompt.clone());
                state.approval_requested_at = Some(now);
                state.approval_timeout_seconds = check.timeout_seconds;
            }
            self.audit_approval(&ctx.session_id, &state_snapshot.step, "requested", &check.condition_id);
            info!(
                condition_id = %check.condition_id,
                step = %state_snapshot.step,
                "requesting approval"
            );
            Some(HookResponse::allow().with_context(format!(
                "**Approval Required**\n\n{}\n\nPlease respond with 'yes' to approve or 'no' to reject.",
                check.prompt
            )))
        }
    }

    // ── Audit helpers ───────────────────────────────────────────────────

    pub(crate) fn audit_tool_call(
        &self,
        session_id: &str,
        step: &str,
        tool_name: &str,
        result: &str,
        reason: Option<&str>,
    ) {
        if let Some(audit) = &self.audit {
            audit.log_tool_call(session_id, step, tool_name, result, reason, None);
        }
    }

    fn audit_rule_eval(
        &self,
        session_id: &str,
        step: &str,
        rule_id: &str,
        condition: &str,
        result: &str,
        reason: Option<&str>,
    ) {
        if let Some(audit) = &self.audit {
            audit.log_rule_eval(session_id, step, rule_id, condition, result, reason);
        }
    }

    pub(crate) fn audit_transition(&self, session_id: &str, from_step: &str, to_step: &str) {
        if let Some(audit) = &self.audit {
            audit.log_transition(session_id, from_step, to_step, None);
        }
    }

    fn audit_approval(&self, session_id: &str, step: &str, result: &str, condition_id: &str) {
        if let Some(audit) = &self.audit {
            audit.log_approval(session_id, step, result, Some(condition_id), None);
        }
    }
}

/// BEFORE_AGENT detection: plan-mode reminders live in the prompt.
fn detection_pass_before_agent(event: &HookEvent, ctx: &ActionContext) {
    let mut state = ctx.state.lock();
    detection::detect_plan_mode_from_context(event, &mut state);
}

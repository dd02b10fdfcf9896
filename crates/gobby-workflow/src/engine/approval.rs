//! Approval gates and exit-condition checking.
//!
//! A `user_approval` exit condition renders a prompt and parks the step
//! behind a four-state machine: idle → awaiting → granted | rejected |
//! timed_out. The user's next prompt is scanned for affirmative/negative
//! keywords; an ambiguous reply re-emits the prompt, and a timeout counts as
//! rejection.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use gobby_storage::WorkflowState;

use crate::definitions::{ExitConditionKind, WorkflowStep};
use crate::expr::{ConditionEvaluator, HelperSources, build_condition_helpers};

const AFFIRMATIVE: [&str; 8] = ["yes", "y", "approve", "approved", "ok", "okay", "sure", "go ahead"];
const NEGATIVE: [&str; 6] = ["no", "n", "reject", "rejected", "deny", "cancel"];

/// The user's answer to a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResponse {
    Approved,
    Rejected,
    Ambiguous,
}

/// Scan a user prompt for an approval keyword. The keyword must lead the
/// reply (ignoring punctuation/case) so ordinary prompts that merely contain
/// "ok" somewhere do not count.
pub fn check_approval_response(prompt: &str) -> ApprovalResponse {
    let normalized = prompt
        .trim()
        .trim_matches(['!', '.', ','])
        .to_lowercase();

    for keyword in AFFIRMATIVE {
        if normalized == keyword || normalized.starts_with(&format!("{keyword} ")) {
            return ApprovalResponse::Approved;
        }
    }
    for keyword in NEGATIVE {
        if normalized == keyword || normalized.starts_with(&format!("{keyword} ")) {
            return ApprovalResponse::Rejected;
        }
    }
    ApprovalResponse::Ambiguous
}

/// A `user_approval` condition that needs attention.
#[derive(Debug, Clone)]
pub struct ApprovalCheck {
    pub condition_id: String,
    pub prompt: String,
    pub timeout_seconds: Option<i64>,
    pub needs_approval: bool,
    pub is_timed_out: bool,
}

/// Find the first `user_approval` exit condition that has not been resolved
/// yet, and whether a pending one has timed out.
pub(crate) fn check_pending_approval(
    step: &WorkflowStep,
    state: &WorkflowState,
    now: DateTime<Utc>,
) -> Option<ApprovalCheck> {
    for condition in &step.exit_conditions {
        let ExitConditionKind::UserApproval {
            condition_id,
            prompt,
            timeout_seconds,
        } = condition.normalized()
        else {
            continue;
        };

        let granted_var = format!("_approval_{condition_id}_granted");
        let rejected_var = format!("_approval_{condition_id}_rejected");
        if state.variables.contains_key(&granted_var)
            || state.variables.contains_key(&rejected_var)
        {
            continue;
        }

        // Already awaiting this condition: check the timeout.
        if state.approval_pending && state.approval_condition_id.as_deref() == Some(&condition_id) {
            let timed_out = match (state.approval_requested_at, state.approval_timeout_seconds) {
                (Some(requested_at), Some(timeout)) => {
                    (now - requested_at).num_seconds() >= timeout
                }
                _ => false,
            };
            return Some(ApprovalCheck {
                condition_id,
                prompt,
                timeout_seconds: state.approval_timeout_seconds,
                needs_approval: false,
                is_timed_out: timed_out,
            });
        }

        return Some(ApprovalCheck {
            condition_id,
            prompt,
            timeout_seconds,
            needs_approval: true,
            is_timed_out: false,
        });
    }
    None
}

/// Clear the awaiting-approval fields on the state.
pub(crate) fn clear_approval(state: &mut WorkflowState) {
    state.approval_pending = false;
    state.approval_condition_id = None;
    state.approval_prompt = None;
    state.approval_requested_at = None;
    state.approval_timeout_seconds = None;
}

/// Check a step's exit conditions (AND logic). `exit_when` is treated as an
/// additional expression condition.
pub(crate) fn check_exit_conditions(
    step: &WorkflowStep,
    state: &WorkflowState,
    evaluator: &ConditionEvaluator,
    helper_sources: &HelperSources,
) -> bool {
    let mut ctx: Map<String, Value> = Map::new();
    ctx.insert(
        "workflow_state".into(),
        serde_json::to_value(state).unwrap_or(Value::Null),
    );
    ctx.insert("variables".into(), Value::Object(state.variables.clone()));
    ctx.insert(
        "step_action_count".into(),
        Value::from(state.step_action_count),
    );
    ctx.insert(
        "total_action_count".into(),
        Value::from(state.total_action_count),
    );
    for (key, value) in &state.variables {
        ctx.entry(key.clone()).or_insert_with(|| value.clone());
    }
    let helpers = build_condition_helpers(helper_sources, &state.variables);

    if let Some(exit_when) = &step.exit_when {
        if !evaluator.evaluate_with_helpers(exit_when, &ctx, &helpers) {
            return false;
        }
    }

    for condition in &step.exit_conditions {
        match condition.normalized() {
            ExitConditionKind::VariableSet { variable } => {
                if !state.variables.contains_key(&variable) {
                    return false;
                }
            }
            ExitConditionKind::Expression { expression } => {
                if !evaluator.evaluate_with_helpers(&expression, &ctx, &helpers) {
                    return false;
                }
            }
            ExitConditionKind::UserApproval { condition_id, .. } => {
                let granted = format!("_approval_{condition_id}_granted");
                if !state
                    .variables
                    .get(&granted)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    return false;
                }
            }
            // Webhook completion is recorded by the webhook receiver as a
            // variable; absent that, the condition is unmet.
            ExitConditionKind::Webhook { .. } => {
                if !state.variables.contains_key("_webhook_completed") {
                    return false;
                }
            }
            ExitConditionKind::Unknown => {}
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with_conditions(conditions: Vec<Value>) -> WorkflowStep {
        serde_json::from_value(json!({
            "name": "gate",
            "exit_conditions": conditions
        }))
        .unwrap()
    }

    #[test]
    fn test_approval_response_keywords() {
        assert_eq!(check_approval_response("yes"), ApprovalResponse::Approved);
        assert_eq!(check_approval_response("Yes!"), ApprovalResponse::Approved);
        assert_eq!(check_approval_response("approve it"), ApprovalResponse::Approved);
        assert_eq!(check_approval_response("go ahead"), ApprovalResponse::Approved);
        assert_eq!(check_approval_response("no"), ApprovalResponse::Rejected);
        assert_eq!(check_approval_response("cancel that"), ApprovalResponse::Rejected);
        assert_eq!(
            check_approval_response("what does this do?"),
            ApprovalResponse::Ambiguous
        );
        // Containing a keyword mid-sentence is not an answer
        assert_eq!(
            check_approval_response("I think it's okay but tell me more"),
            ApprovalResponse::Ambiguous
        );
    }

    #[test]
    fn test_pending_approval_lifecycle() {
        let step = step_with_conditions(vec![json!({
            "type": "user_approval",
            "condition_id": "go",
            "prompt": "Proceed?",
            "timeout_seconds": 60
        })]);
        let mut state = WorkflowState::new("s", "wf", "gate");
        let now = Utc::now();

        // Fresh: needs approval
        let check = check_pending_approval(&step, &state, now).unwrap();
        assert!(check.needs_approval);
        assert_eq!(check.condition_id, "go");
        assert_eq!(check.prompt, "Proceed?");
        assert_eq!(check.timeout_seconds, Some(60));

        // Awaiting, within timeout
        state.approval_pending = true;
        state.approval_condition_id = Some("go".into());
        state.approval_requested_at = Some(now);
        state.approval_timeout_seconds = Some(60);
        let check = check_pending_approval(&step, &state, now + chrono::Duration::seconds(10))
            .unwrap();
        assert!(!check.needs_approval);
        assert!(!check.is_timed_out);

        // Awaiting, past timeout
        let check = check_pending_approval(&step, &state, now + chrono::Duration::seconds(61))
            .unwrap();
        assert!(check.is_timed_out);

        // Granted: no further checks
        state.variables.insert("_approval_go_granted".into(), json!(true));
        assert!(check_pending_approval(&step, &state, now).is_none());
    }

    #[test]
    fn test_exit_conditions_and_logic() {
        let step = step_with_conditions(vec![
            json!("done"),
            json!({"type": "variable_set", "variable": "reviewed"}),
        ]);
        let mut state = WorkflowState::new("s", "wf", "gate");
        let evaluator = ConditionEvaluator::new();
        let sources = HelperSources::default();

        assert!(!check_exit_conditions(&step, &state, &evaluator, &sources));

        state.variables.insert("done".into(), json!(true));
        assert!(!check_exit_conditions(&step, &state, &evaluator, &sources));

        state.variables.insert("reviewed".into(), json!("anything"));
        assert!(check_exit_conditions(&step, &state, &evaluator, &sources));
    }

    #[test]
    fn test_exit_when_shorthand_anded() {
        let mut step = step_with_conditions(vec![json!("done")]);
        step.exit_when = Some("count > 2".into());
        let mut state = WorkflowState::new("s", "wf", "gate");
        state.variables.insert("done".into(), json!(true));
        state.variables.insert("count".into(), json!(1));

        let evaluator = ConditionEvaluator::new();
        let sources = HelperSources::default();
        assert!(!check_exit_conditions(&step, &state, &evaluator, &sources));

        state.variables.insert("count".into(), json!(3));
        assert!(check_exit_conditions(&step, &state, &evaluator, &sources));
    }

    #[test]
    fn test_approval_exit_condition_requires_grant() {
        let step = step_with_conditions(vec![json!({
            "type": "user_approval",
            "condition_id": "go",
            "prompt": "Proceed?"
        })]);
        let mut state = WorkflowState::new("s", "wf", "gate");
        let evaluator = ConditionEvaluator::new();
        let sources = HelperSources::default();

        assert!(!check_exit_conditions(&step, &state, &evaluator, &sources));
        state.variables.insert("_approval_go_granted".into(), json!(true));
        assert!(check_exit_conditions(&step, &state, &evaluator, &sources));
    }

    #[test]
    fn test_clear_approval() {
        let mut state = WorkflowState::new("s", "wf", "gate");
        state.approval_pending = true;
        state.approval_condition_id = Some("go".into());
        state.approval_prompt = Some("Proceed?".into());
        state.approval_requested_at = Some(Utc::now());
        state.approval_timeout_seconds = Some(60);

        clear_approval(&mut state);
        assert!(!state.approval_pending);
        assert!(state.approval_condition_id.is_none());
        assert!(state.approval_prompt.is_none());
        assert!(state.approval_requested_at.is_none());
        assert!(state.approval_timeout_seconds.is_none());
    }
}

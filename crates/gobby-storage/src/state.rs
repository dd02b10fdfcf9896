//! Workflow state persistence with atomic variable merges.
//!
//! `workflow_states` has one row per session. The row either belongs to the
//! session's active step workflow, or carries the `__lifecycle__` /
//! `__ended__` sentinel name and only stores lifecycle variables. Every
//! mutator that reads-modifies-writes the variables JSON runs under
//! `BEGIN IMMEDIATE` so concurrent hook evaluations cannot clobber each
//! other's updates.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::database::Database;
use crate::{ENDED_WORKFLOW, LIFECYCLE_WORKFLOW, Result};

/// Runtime state of a session's workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_name: String,
    pub step: String,
    pub step_entered_at: Option<DateTime<Utc>>,
    pub step_action_count: i64,
    pub total_action_count: i64,

    pub observations: Vec<Value>,

    pub reflection_pending: bool,
    pub context_injected: bool,

    pub variables: Map<String, Value>,

    // Task decomposition state
    pub task_list: Option<Vec<Value>>,
    pub current_task_index: i64,
    pub files_modified_this_task: i64,

    // Approval state for user_approval exit conditions
    pub approval_pending: bool,
    pub approval_condition_id: Option<String>,
    pub approval_prompt: Option<String>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub approval_timeout_seconds: Option<i64>,

    // Escape hatch: temporarily disable enforcement
    pub disabled: bool,
    pub disabled_reason: Option<String>,

    // Initial step, kept for reset functionality
    pub initial_step: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state for a step workflow entering `step`.
    pub fn new(session_id: impl Into<String>, workflow_name: impl Into<String>, step: impl Into<String>) -> Self {
        let now = Utc::now();
        let step = step.into();
        Self {
            session_id: session_id.into(),
            workflow_name: workflow_name.into(),
            initial_step: Some(step.clone()),
            step,
            step_entered_at: Some(now),
            step_action_count: 0,
            total_action_count: 0,
            observations: Vec::new(),
            reflection_pending: false,
            context_injected: false,
            variables: Map::new(),
            task_list: None,
            current_task_index: 0,
            files_modified_this_task: 0,
            approval_pending: false,
            approval_condition_id: None,
            approval_prompt: None,
            approval_requested_at: None,
            approval_timeout_seconds: None,
            disabled: false,
            disabled_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sentinel row used to persist lifecycle variables for a session that
    /// has no active step workflow.
    pub fn lifecycle(session_id: impl Into<String>) -> Self {
        let mut state = Self::new(session_id, LIFECYCLE_WORKFLOW, "");
        state.initial_step = None;
        state
    }

    /// Whether this row is one of the sentinel names rather than an active
    /// step workflow.
    pub fn is_sentinel(&self) -> bool {
        self.workflow_name == LIFECYCLE_WORKFLOW || self.workflow_name == ENDED_WORKFLOW
    }
}

/// Atomic list operations against the orchestration tracking variables.
#[derive(Debug, Default, Clone)]
pub struct ListUpdate {
    /// Session ids to remove from `spawned_agents`.
    pub remove_from_spawned: Vec<String>,
    /// Agent entries to append to `spawned_agents`.
    pub append_to_spawned: Vec<Value>,
    /// Agent entries to append to `completed_agents`.
    pub append_to_completed: Vec<Value>,
    /// Agent entries to append to `failed_agents`.
    pub append_to_failed: Vec<Value>,
    /// When set, replaces `spawned_agents` entirely (takes precedence over
    /// `remove_from_spawned`).
    pub replace_spawned: Option<Vec<Value>>,
}

/// Persistence for [`WorkflowState`] rows.
#[derive(Clone)]
pub struct WorkflowStateManager {
    db: Database,
}

impl WorkflowStateManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn get_state(&self, session_id: &str) -> Result<Option<WorkflowState>> {
        let conn = self.db.conn();
        let state = conn
            .query_row(
                "SELECT session_id, workflow_name, step, step_entered_at,
                        step_action_count, total_action_count, observations,
                        reflection_pending, context_injected, variables,
                        task_list, current_task_index, files_modified_this_task,
                        approval_pending, approval_condition_id, approval_prompt,
                        approval_requested_at, approval_timeout_seconds,
                        disabled, disabled_reason, initial_step,
                        created_at, updated_at
                 FROM workflow_states WHERE session_id = ?1",
                params![session_id],
                row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    /// Upsert the full state row, keyed by `session_id`.
    pub fn save_state(&self, state: &WorkflowState) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO workflow_states (
                session_id, workflow_name, step, step_entered_at,
                step_action_count, total_action_count, observations,
                reflection_pending, context_injected, variables,
                task_list, current_task_index, files_modified_this_task,
                approval_pending, approval_condition_id, approval_prompt,
                approval_requested_at, approval_timeout_seconds,
                disabled, disabled_reason, initial_step, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            ON CONFLICT(session_id) DO UPDATE SET
                workflow_name = excluded.workflow_name,
                step = excluded.step,
                step_entered_at = excluded.step_entered_at,
                step_action_count = excluded.step_action_count,
                total_action_count = excluded.total_action_count,
                observations = excluded.observations,
                reflection_pending = excluded.reflection_pending,
                context_injected = excluded.context_injected,
                variables = excluded.variables,
                task_list = excluded.task_list,
                current_task_index = excluded.current_task_index,
                files_modified_this_task = excluded.files_modified_this_task,
                approval_pending = excluded.approval_pending,
                approval_condition_id = excluded.approval_condition_id,
                approval_prompt = excluded.approval_prompt,
                approval_requested_at = excluded.approval_requested_at,
                approval_timeout_seconds = excluded.approval_timeout_seconds,
                disabled = excluded.disabled,
                disabled_reason = excluded.disabled_reason,
                initial_step = excluded.initial_step,
                updated_at = excluded.updated_at",
            params![
                state.session_id,
                state.workflow_name,
                state.step,
                state.step_entered_at.map(|t| t.to_rfc3339()),
                state.step_action_count,
                state.total_action_count,
                serde_json::to_string(&state.observations)?,
                state.reflection_pending as i64,
                state.context_injected as i64,
                serde_json::to_string(&state.variables)?,
                state
                    .task_list
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                state.current_task_index,
                state.files_modified_this_task,
                state.approval_pending as i64,
                state.approval_condition_id,
                state.approval_prompt,
                state.approval_requested_at.map(|t| t.to_rfc3339()),
                state.approval_timeout_seconds,
                state.disabled as i64,
                state.disabled_reason,
                state.initial_step,
                state.created_at.to_rfc3339(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Atomically merge variable updates into the stored variables JSON.
    ///
    /// The read-modify-write is serialized under `BEGIN IMMEDIATE`, so
    /// concurrent evaluations for the same session cannot lose updates.
    ///
    /// Returns `true` on success, `false` when the session has no state row.
    /// Empty updates are a no-op.
    pub fn merge_variables(&self, session_id: &str, updates: &Map<String, Value>) -> Result<bool> {
        if updates.is_empty() {
            return Ok(true);
        }
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT variables FROM workflow_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = existing else {
            warn!(session_id, "merge_variables: no workflow state found");
            return Ok(false);
        };

        let mut current: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();
        for (key, value) in updates {
            current.insert(key.clone(), value.clone());
        }

        tx.execute(
            "UPDATE workflow_states SET variables = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![
                serde_json::to_string(&current)?,
                Utc::now().to_rfc3339(),
                session_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Atomically update the orchestration tracking lists
    /// (`spawned_agents` / `completed_agents` / `failed_agents`).
    pub fn update_orchestration_lists(&self, session_id: &str, update: ListUpdate) -> Result<bool> {
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT variables FROM workflow_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = existing else {
            warn!(session_id, "update_orchestration_lists: no workflow state");
            return Ok(false);
        };

        let mut variables: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();

        if let Some(replacement) = update.replace_spawned {
            variables.insert("spawned_agents".into(), Value::Array(replacement));
        } else if !update.remove_from_spawned.is_empty() {
            let current = take_list(&mut variables, "spawned_agents");
            let filtered: Vec<Value> = current
                .into_iter()
                .filter(|entry| {
                    entry
                        .get("session_id")
                        .and_then(Value::as_str)
                        .is_none_or(|id| !update.remove_from_spawned.iter().any(|r| r == id))
                })
                .collect();
            variables.insert("spawned_agents".into(), Value::Array(filtered));
        }

        if !update.append_to_spawned.is_empty() {
            append_list(&mut variables, "spawned_agents", update.append_to_spawned);
        }
        if !update.append_to_completed.is_empty() {
            append_list(&mut variables, "completed_agents", update.append_to_completed);
        }
        if !update.append_to_failed.is_empty() {
            append_list(&mut variables, "failed_agents", update.append_to_failed);
        }

        tx.execute(
            "UPDATE workflow_states SET variables = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![
                serde_json::to_string(&variables)?,
                Utc::now().to_rfc3339(),
                session_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Atomically check capacity and reserve spawn slots against the
    /// `_reserved_slots` counter. Returns the number of slots actually
    /// reserved (0 when at capacity). The caller MUST call
    /// [`release_reserved_slots`](Self::release_reserved_slots) once
    /// spawning completes, whether it succeeded or failed.
    pub fn check_and_reserve_slots(
        &self,
        session_id: &str,
        max_concurrent: usize,
        requested: usize,
    ) -> Result<usize> {
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT variables FROM workflow_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = existing else {
            return Ok(0);
        };

        let mut variables: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();
        let spawned_count = variables
            .get("spawned_agents")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let reserved = variables
            .get("_reserved_slots")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let available = max_concurrent.saturating_sub(spawned_count + reserved);
        let slots = available.min(requested);

        if slots > 0 {
            variables.insert("_reserved_slots".into(), Value::from(reserved + slots));
            tx.execute(
                "UPDATE workflow_states SET variables = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![
                    serde_json::to_string(&variables)?,
                    Utc::now().to_rfc3339(),
                    session_id
                ],
            )?;
            tx.commit()?;
        }

        Ok(slots)
    }

    /// Release previously reserved spawn slots.
    pub fn release_reserved_slots(&self, session_id: &str, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT variables FROM workflow_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = existing else {
            return Ok(());
        };

        let mut variables: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();
        let reserved = variables
            .get("_reserved_slots")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        variables.insert(
            "_reserved_slots".into(),
            Value::from(reserved.saturating_sub(count)),
        );

        tx.execute(
            "UPDATE workflow_states SET variables = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![
                serde_json::to_string(&variables)?,
                Utc::now().to_rfc3339(),
                session_id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Clear step workflow state while preserving lifecycle variables.
    ///
    /// Step fields are reset and the workflow name becomes `__ended__`
    /// (a placeholder rather than NULL, to satisfy the NOT NULL schema).
    /// The variables JSON is left untouched.
    pub fn delete_state(&self, session_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE workflow_states SET
                workflow_name = ?1,
                step = ?1,
                step_entered_at = NULL,
                step_action_count = 0,
                total_action_count = 0,
                observations = '[]',
                reflection_pending = 0,
                context_injected = 0,
                task_list = NULL,
                current_task_index = 0,
                files_modified_this_task = 0,
                approval_pending = 0,
                approval_condition_id = NULL,
                approval_prompt = NULL,
                approval_requested_at = NULL,
                approval_timeout_seconds = NULL,
                initial_step = NULL,
                updated_at = ?2
             WHERE session_id = ?3",
            params![ENDED_WORKFLOW, Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }
}

fn take_list(variables: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match variables.remove(key) {
        Some(Value::Array(list)) => list,
        _ => Vec::new(),
    }
}

fn append_list(variables: &mut Map<String, Value>, key: &str, entries: Vec<Value>) {
    let mut current = take_list(variables, key);
    current.extend(entries);
    variables.insert(key.to_string(), Value::Array(current));
}

fn parse_dt(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowState> {
    let observations: String = row.get(6)?;
    let variables: String = row.get(9)?;
    let task_list: Option<String> = row.get(10)?;
    Ok(WorkflowState {
        session_id: row.get(0)?,
        workflow_name: row.get(1)?,
        step: row.get(2)?,
        step_entered_at: row
            .get::<_, Option<String>>(3)?
            .as_deref()
            .map(parse_dt),
        step_action_count: row.get(4)?,
        total_action_count: row.get(5)?,
        observations: serde_json::from_str(&observations).unwrap_or_default(),
        reflection_pending: row.get::<_, i64>(7)? != 0,
        context_injected: row.get::<_, i64>(8)? != 0,
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        task_list: task_list.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
        current_task_index: row.get(11)?,
        files_modified_this_task: row.get(12)?,
        approval_pending: row.get::<_, i64>(13)? != 0,
        approval_condition_id: row.get(14)?,
        approval_prompt: row.get(15)?,
        approval_requested_at: row
            .get::<_, Option<String>>(16)?
            .as_deref()
            .map(parse_dt),
        approval_timeout_seconds: row.get(17)?,
        disabled: row.get::<_, i64>(18)? != 0,
        disabled_reason: row.get(19)?,
        initial_step: row.get(20)?,
        created_at: parse_dt(&row.get::<_, String>(21)?),
        updated_at: parse_dt(&row.get::<_, String>(22)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> WorkflowStateManager {
        WorkflowStateManager::new(Database::open_in_memory().unwrap())
    }

    fn sample_state(session_id: &str) -> WorkflowState {
        let mut state = WorkflowState::new(session_id, "dev-loop", "implement");
        state.variables.insert("ready".into(), json!(false));
        state.variables.insert("count".into(), json!(3));
        state.approval_timeout_seconds = Some(60);
        state.observations.push(json!({"note": "first"}));
        state.task_list = Some(vec![json!({"title": "do the thing"})]);
        state
    }

    #[test]
    fn test_save_and_get_roundtrip() {
        let mgr = manager();
        let state = sample_state("sess-1");
        mgr.save_state(&state).unwrap();

        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.workflow_name, state.workflow_name);
        assert_eq!(loaded.step, state.step);
        assert_eq!(loaded.variables, state.variables);
        assert_eq!(loaded.observations, state.observations);
        assert_eq!(loaded.task_list, state.task_list);
        assert_eq!(loaded.approval_timeout_seconds, Some(60));
        assert_eq!(loaded.initial_step.as_deref(), Some("implement"));
        assert!(!loaded.disabled);
    }

    #[test]
    fn test_get_state_missing() {
        let mgr = manager();
        assert!(mgr.get_state("nope").unwrap().is_none());
    }

    #[test]
    fn test_merge_variables() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();

        let mut updates = Map::new();
        updates.insert("ready".into(), json!(true));
        updates.insert("new_var".into(), json!("hello"));
        assert!(mgr.merge_variables("sess-1", &updates).unwrap());

        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(loaded.variables["ready"], json!(true));
        assert_eq!(loaded.variables["new_var"], json!("hello"));
        // untouched key survives
        assert_eq!(loaded.variables["count"], json!(3));
    }

    #[test]
    fn test_merge_variables_missing_session() {
        let mgr = manager();
        let mut updates = Map::new();
        updates.insert("k".into(), json!(1));
        assert!(!mgr.merge_variables("missing", &updates).unwrap());
    }

    #[test]
    fn test_merge_variables_empty_is_noop() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();
        let before = mgr.get_state("sess-1").unwrap().unwrap();
        assert!(mgr.merge_variables("sess-1", &Map::new()).unwrap());
        let after = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(before.variables, after.variables);
    }

    #[test]
    fn test_concurrent_merges_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stress.db");
        let mgr = WorkflowStateManager::new(Database::open(&path).unwrap());
        mgr.save_state(&WorkflowState::new("sess-1", "wf", "a")).unwrap();

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    let mut updates = Map::new();
                    updates.insert(format!("writer_{i}"), json!(i));
                    assert!(mgr.merge_variables("sess-1", &updates).unwrap());
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        for i in 0..16 {
            assert_eq!(loaded.variables[&format!("writer_{i}")], json!(i), "lost update {i}");
        }
    }

    #[test]
    fn test_orchestration_list_updates() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();

        mgr.update_orchestration_lists(
            "sess-1",
            ListUpdate {
                append_to_spawned: vec![json!({"session_id": "a"}), json!({"session_id": "b"})],
                ..Default::default()
            },
        )
        .unwrap();

        mgr.update_orchestration_lists(
            "sess-1",
            ListUpdate {
                remove_from_spawned: vec!["a".into()],
                append_to_completed: vec![json!({"session_id": "a"})],
                ..Default::default()
            },
        )
        .unwrap();

        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(loaded.variables["spawned_agents"], json!([{"session_id": "b"}]));
        assert_eq!(loaded.variables["completed_agents"], json!([{"session_id": "a"}]));
    }

    #[test]
    fn test_replace_spawned_takes_precedence() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();
        mgr.update_orchestration_lists(
            "sess-1",
            ListUpdate {
                append_to_spawned: vec![json!({"session_id": "a"})],
                ..Default::default()
            },
        )
        .unwrap();
        mgr.update_orchestration_lists(
            "sess-1",
            ListUpdate {
                remove_from_spawned: vec!["a".into()],
                replace_spawned: Some(vec![json!({"session_id": "z"})]),
                ..Default::default()
            },
        )
        .unwrap();
        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(loaded.variables["spawned_agents"], json!([{"session_id": "z"}]));
    }

    #[test]
    fn test_slot_reservation() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();

        // 2 already spawned, cap of 4 → only 2 available
        mgr.update_orchestration_lists(
            "sess-1",
            ListUpdate {
                append_to_spawned: vec![json!({"session_id": "a"}), json!({"session_id": "b"})],
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(mgr.check_and_reserve_slots("sess-1", 4, 3).unwrap(), 2);
        // All capacity reserved now
        assert_eq!(mgr.check_and_reserve_slots("sess-1", 4, 1).unwrap(), 0);

        mgr.release_reserved_slots("sess-1", 2).unwrap();
        assert_eq!(mgr.check_and_reserve_slots("sess-1", 4, 1).unwrap(), 1);
    }

    #[test]
    fn test_reserve_slots_missing_session() {
        let mgr = manager();
        assert_eq!(mgr.check_and_reserve_slots("missing", 4, 2).unwrap(), 0);
    }

    #[test]
    fn test_delete_state_preserves_variables() {
        let mgr = manager();
        mgr.save_state(&sample_state("sess-1")).unwrap();
        mgr.delete_state("sess-1").unwrap();

        let loaded = mgr.get_state("sess-1").unwrap().unwrap();
        assert_eq!(loaded.workflow_name, ENDED_WORKFLOW);
        assert_eq!(loaded.step, ENDED_WORKFLOW);
        assert!(loaded.step_entered_at.is_none());
        assert_eq!(loaded.step_action_count, 0);
        assert!(loaded.task_list.is_none());
        assert!(loaded.is_sentinel());
        // lifecycle variables survive
        assert_eq!(loaded.variables["count"], json!(3));
    }

    #[test]
    fn test_lifecycle_sentinel() {
        let state = WorkflowState::lifecycle("sess-9");
        assert!(state.is_sentinel());
        assert!(state.initial_step.is_none());
    }
}

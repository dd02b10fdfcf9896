//! Per-(session, workflow) instance rows.
//!
//! Supports multiple concurrent workflows per session. Each instance carries
//! its own scoped variables and step position, keyed by
//! `UNIQUE(session_id, workflow_name)`, and can be enabled or disabled
//! independently.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::Result;
use crate::database::Database;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: String,
    pub session_id: String,
    pub workflow_name: String,
    pub enabled: bool,
    pub priority: i64,
    pub current_step: Option<String>,
    pub step_entered_at: Option<DateTime<Utc>>,
    pub step_action_count: i64,
    pub total_action_count: i64,
    pub variables: Map<String, Value>,
    pub context_injected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(session_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            workflow_name: workflow_name.into(),
            enabled: true,
            priority: 100,
            current_step: None,
            step_entered_at: None,
            step_action_count: 0,
            total_action_count: 0,
            variables: Map::new(),
            context_injected: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// CRUD for workflow instances.
#[derive(Clone)]
pub struct WorkflowInstanceManager {
    db: Database,
}

impl WorkflowInstanceManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_instance(
        &self,
        session_id: &str,
        workflow_name: &str,
    ) -> Result<Option<WorkflowInstance>> {
        let conn = self.db.conn();
        let instance = conn
            .query_row(
                "SELECT id, session_id, workflow_name, enabled, priority, current_step,
                        step_entered_at, step_action_count, total_action_count,
                        variables, context_injected, created_at, updated_at
                 FROM workflow_instances WHERE session_id = ?1 AND workflow_name = ?2",
                params![session_id, workflow_name],
                row_to_instance,
            )
            .optional()?;
        Ok(instance)
    }

    /// All enabled instances for a session, priority ascending.
    pub fn get_active_instances(&self, session_id: &str) -> Result<Vec<WorkflowInstance>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, workflow_name, enabled, priority, current_step,
                    step_entered_at, step_action_count, total_action_count,
                    variables, context_injected, created_at, updated_at
             FROM workflow_instances WHERE session_id = ?1 AND enabled = 1
             ORDER BY priority ASC",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_instance)?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    /// Upsert on `(session_id, workflow_name)`.
    pub fn save_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO workflow_instances (
                id, session_id, workflow_name, enabled, priority,
                current_step, step_entered_at, step_action_count, total_action_count,
                variables, context_injected, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(session_id, workflow_name) DO UPDATE SET
                enabled = excluded.enabled,
                priority = excluded.priority,
                current_step = excluded.current_step,
                step_entered_at = excluded.step_entered_at,
                step_action_count = excluded.step_action_count,
                total_action_count = excluded.total_action_count,
                variables = excluded.variables,
                context_injected = excluded.context_injected,
                updated_at = excluded.updated_at",
            params![
                instance.id,
                instance.session_id,
                instance.workflow_name,
                instance.enabled as i64,
                instance.priority,
                instance.current_step,
                instance.step_entered_at.map(|t| t.to_rfc3339()),
                instance.step_action_count,
                instance.total_action_count,
                serde_json::to_string(&instance.variables)?,
                instance.context_injected as i64,
                instance.created_at.to_rfc3339(),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn delete_instance(&self, session_id: &str, workflow_name: &str) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM workflow_instances WHERE session_id = ?1 AND workflow_name = ?2",
            params![session_id, workflow_name],
        )?;
        Ok(())
    }

    pub fn set_enabled(&self, session_id: &str, workflow_name: &str, enabled: bool) -> Result<()> {
        self.db.conn().execute(
            "UPDATE workflow_instances SET enabled = ?1, updated_at = ?2
             WHERE session_id = ?3 AND workflow_name = ?4",
            params![
                enabled as i64,
                Utc::now().to_rfc3339(),
                session_id,
                workflow_name
            ],
        )?;
        Ok(())
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let variables: String = row.get(9)?;
    Ok(WorkflowInstance {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workflow_name: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        current_step: row.get(5)?,
        step_entered_at: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        step_action_count: row.get(7)?,
        total_action_count: row.get(8)?,
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        context_injected: row.get::<_, i64>(10)? != 0,
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(11)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(12)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> WorkflowInstanceManager {
        WorkflowInstanceManager::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_save_get_roundtrip() {
        let mgr = manager();
        let mut instance = WorkflowInstance::new("sess-1", "review-loop");
        instance.current_step = Some("review".into());
        instance.variables.insert("k".into(), json!(1));
        mgr.save_instance(&instance).unwrap();

        let loaded = mgr.get_instance("sess-1", "review-loop").unwrap().unwrap();
        assert_eq!(loaded.id, instance.id);
        assert_eq!(loaded.current_step.as_deref(), Some("review"));
        assert_eq!(loaded.variables["k"], json!(1));
    }

    #[test]
    fn test_upsert_on_conflict() {
        let mgr = manager();
        let mut instance = WorkflowInstance::new("sess-1", "review-loop");
        mgr.save_instance(&instance).unwrap();
        instance.priority = 5;
        mgr.save_instance(&instance).unwrap();

        let loaded = mgr.get_instance("sess-1", "review-loop").unwrap().unwrap();
        assert_eq!(loaded.priority, 5);
    }

    #[test]
    fn test_active_instances_sorted_by_priority() {
        let mgr = manager();
        let mut low = WorkflowInstance::new("sess-1", "b");
        low.priority = 200;
        let mut high = WorkflowInstance::new("sess-1", "a");
        high.priority = 10;
        let mut disabled = WorkflowInstance::new("sess-1", "c");
        disabled.enabled = false;
        mgr.save_instance(&low).unwrap();
        mgr.save_instance(&high).unwrap();
        mgr.save_instance(&disabled).unwrap();

        let active = mgr.get_active_instances("sess-1").unwrap();
        let names: Vec<&str> = active.iter().map(|i| i.workflow_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_set_enabled_and_delete() {
        let mgr = manager();
        mgr.save_instance(&WorkflowInstance::new("sess-1", "wf")).unwrap();
        mgr.set_enabled("sess-1", "wf", false).unwrap();
        assert!(mgr.get_active_instances("sess-1").unwrap().is_empty());

        mgr.delete_instance("sess-1", "wf").unwrap();
        assert!(mgr.get_instance("sess-1", "wf").unwrap().is_none());
    }
}

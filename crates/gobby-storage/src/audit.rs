//! Best-effort workflow audit log.
//!
//! Records tool-call permission checks, rule evaluations, transitions, and
//! approval gate events. Audit failures never propagate into hook handling;
//! they are logged and swallowed.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::debug;

use crate::database::Database;

#[derive(Clone)]
pub struct WorkflowAuditManager {
    db: Database,
}

impl WorkflowAuditManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn log_tool_call(
        &self,
        session_id: &str,
        step: &str,
        tool_name: &str,
        result: &str,
        reason: Option<&str>,
        context: Option<&Value>,
    ) {
        self.insert(
            session_id,
            Some(step),
            "tool_call",
            Some(tool_name),
            None,
            None,
            None,
            None,
            result,
            reason,
            context,
        );
    }

    pub fn log_rule_eval(
        &self,
        session_id: &str,
        step: &str,
        rule_id: &str,
        condition: &str,
        result: &str,
        reason: Option<&str>,
    ) {
        self.insert(
            session_id,
            Some(step),
            "rule_eval",
            None,
            Some(rule_id),
            Some(condition),
            None,
            None,
            result,
            reason,
            None,
        );
    }

    pub fn log_transition(&self, session_id: &str, from_step: &str, to_step: &str, reason: Option<&str>) {
        self.insert(
            session_id,
            None,
            "transition",
            None,
            None,
            None,
            Some(from_step),
            Some(to_step),
            "ok",
            reason,
            None,
        );
    }

    pub fn log_approval(
        &self,
        session_id: &str,
        step: &str,
        result: &str,
        condition_id: Option<&str>,
        prompt: Option<&str>,
    ) {
        self.insert(
            session_id,
            Some(step),
            "approval",
            None,
            condition_id,
            None,
            None,
            None,
            result,
            prompt,
            None,
        );
    }

    /// Count audit rows of a kind for a session. Used by tests and the
    /// workflow status surface.
    pub fn count(&self, session_id: &str, kind: &str) -> i64 {
        self.db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM workflow_audit WHERE session_id = ?1 AND kind = ?2",
                params![session_id, kind],
                |row| row.get(0),
            )
            .unwrap_or(0)
    }

    /// Most recent result values of a kind for a session, newest first.
    pub fn recent_results(&self, session_id: &str, kind: &str, limit: usize) -> Vec<String> {
        let conn = self.db.conn();
        let Ok(mut stmt) = conn.prepare(
            "SELECT result FROM workflow_audit WHERE session_id = ?1 AND kind = ?2
             ORDER BY id DESC LIMIT ?3",
        ) else {
            return Vec::new();
        };
        let Ok(rows) = stmt.query_map(params![session_id, kind, limit as i64], |row| {
            row.get::<_, String>(0)
        }) else {
            return Vec::new();
        };
        rows.flatten().collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        session_id: &str,
        step: Option<&str>,
        kind: &str,
        tool_name: Option<&str>,
        rule_id: Option<&str>,
        condition: Option<&str>,
        from_step: Option<&str>,
        to_step: Option<&str>,
        result: &str,
        reason: Option<&str>,
        context: Option<&Value>,
    ) {
        let outcome = self.db.conn().execute(
            "INSERT INTO workflow_audit (
                session_id, step, kind, tool_name, rule_id, condition,
                from_step, to_step, result, reason, context, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session_id,
                step,
                kind,
                tool_name,
                rule_id,
                condition,
                from_step,
                to_step,
                result,
                reason,
                context.map(Value::to_string),
                Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = outcome {
            debug!(session_id, kind, error = %e, "failed to write audit row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_audit() {
        let audit = WorkflowAuditManager::new(Database::open_in_memory().unwrap());
        audit.log_tool_call("sess-1", "implement", "Bash", "block", Some("blocked"), None);
        audit.log_tool_call("sess-1", "implement", "Read", "allow", None, None);

        assert_eq!(audit.count("sess-1", "tool_call"), 2);
        assert_eq!(
            audit.recent_results("sess-1", "tool_call", 10),
            vec!["allow".to_string(), "block".to_string()]
        );
    }

    #[test]
    fn test_transition_and_approval_audit() {
        let audit = WorkflowAuditManager::new(Database::open_in_memory().unwrap());
        audit.log_transition("sess-1", "a", "b", None);
        audit.log_approval("sess-1", "b", "requested", Some("go"), Some("Proceed?"));

        assert_eq!(audit.count("sess-1", "transition"), 1);
        assert_eq!(audit.count("sess-1", "approval"), 1);
        assert_eq!(audit.count("sess-2", "approval"), 0);
    }
}

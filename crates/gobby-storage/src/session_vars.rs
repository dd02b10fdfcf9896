//! Agent-facing session variable key-value store.
//!
//! Written by the `set_variable` MCP tool. These values are authoritative
//! over `workflow_states.variables` at evaluation-context build time, which
//! is why the engine loads them into `_session_variables_override`.

use chrono::Utc;
use rusqlite::params;
use serde_json::{Map, Value};

use crate::Result;
use crate::database::Database;

#[derive(Clone)]
pub struct SessionVariableStore {
    db: Database,
}

impl SessionVariableStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn set_variable(&self, session_id: &str, name: &str, value: &Value) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO session_variables (session_id, name, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, name) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            params![
                session_id,
                name,
                serde_json::to_string(value)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_variables(&self, session_id: &str) -> Result<Map<String, Value>> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare("SELECT name, value FROM session_variables WHERE session_id = ?1")?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut variables = Map::new();
        for row in rows {
            let (name, raw) = row?;
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            variables.insert(name, value);
        }
        Ok(variables)
    }
}

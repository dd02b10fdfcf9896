//! Connection bootstrap and schema initialization.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_states (
    session_id TEXT PRIMARY KEY,
    workflow_name TEXT NOT NULL,
    step TEXT NOT NULL,
    step_entered_at TEXT,
    step_action_count INTEGER NOT NULL DEFAULT 0,
    total_action_count INTEGER NOT NULL DEFAULT 0,
    observations TEXT NOT NULL DEFAULT '[]',
    reflection_pending INTEGER NOT NULL DEFAULT 0,
    context_injected INTEGER NOT NULL DEFAULT 0,
    variables TEXT NOT NULL DEFAULT '{}',
    task_list TEXT,
    current_task_index INTEGER NOT NULL DEFAULT 0,
    files_modified_this_task INTEGER NOT NULL DEFAULT 0,
    approval_pending INTEGER NOT NULL DEFAULT 0,
    approval_condition_id TEXT,
    approval_prompt TEXT,
    approval_requested_at TEXT,
    approval_timeout_seconds INTEGER,
    disabled INTEGER NOT NULL DEFAULT 0,
    disabled_reason TEXT,
    initial_step TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_instances (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    workflow_name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 100,
    current_step TEXT,
    step_entered_at TEXT,
    step_action_count INTEGER NOT NULL DEFAULT 0,
    total_action_count INTEGER NOT NULL DEFAULT 0,
    variables TEXT NOT NULL DEFAULT '{}',
    context_injected INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(session_id, workflow_name)
);

CREATE TABLE IF NOT EXISTS session_variables (
    session_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(session_id, name)
);

CREATE TABLE IF NOT EXISTS rules (
    name TEXT NOT NULL,
    tier TEXT NOT NULL CHECK (tier IN ('project', 'user', 'bundled')),
    definition TEXT NOT NULL,
    project_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(name, tier, project_id)
);

CREATE TABLE IF NOT EXISTS workflow_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    step TEXT,
    kind TEXT NOT NULL CHECK (kind IN ('tool_call', 'rule_eval', 'transition', 'approval')),
    tool_name TEXT,
    rule_id TEXT,
    condition TEXT,
    from_step TEXT,
    to_step TEXT,
    result TEXT NOT NULL,
    reason TEXT,
    context TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_audit_session
    ON workflow_audit(session_id, created_at);
"#;

/// Shared SQLite handle. Thread-safe via an internal `Mutex<Connection>`;
/// multi-statement mutations take the lock once and run an immediate-mode
/// transaction inside it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for use.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('workflow_states', 'workflow_instances', 'session_variables', 'rules', 'workflow_audit')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("gobby.db")).unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM workflow_states", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

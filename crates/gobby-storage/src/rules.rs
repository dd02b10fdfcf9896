//! Tiered rule store.
//!
//! Named rule definitions live in three tiers with project > user > bundled
//! precedence. Step `check_rules` that are not satisfied by a workflow's own
//! `rule_definitions` fall through to this store.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::database::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTier {
    Project,
    User,
    Bundled,
}

impl RuleTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTier::Project => "project",
            RuleTier::User => "user",
            RuleTier::Bundled => "bundled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRule {
    pub name: String,
    pub tier: RuleTier,
    pub definition: Value,
    pub project_id: Option<String>,
}

#[derive(Clone)]
pub struct RuleStore {
    db: Database,
}

impl RuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn put_rule(
        &self,
        name: &str,
        tier: RuleTier,
        definition: &Value,
        project_id: Option<&str>,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO rules (name, tier, definition, project_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name, tier, project_id) DO UPDATE SET
                 definition = excluded.definition",
            params![
                name,
                tier.as_str(),
                serde_json::to_string(definition)?,
                project_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Look up a rule by name, honoring tier precedence. Project-tier rules
    /// only match when `project_id` agrees.
    pub fn get_rule(&self, name: &str, project_id: Option<&str>) -> Result<Option<StoredRule>> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT name, tier, definition, project_id FROM rules
                 WHERE name = ?1
                   AND (tier != 'project' OR project_id = ?2)
                 ORDER BY CASE tier
                     WHEN 'project' THEN 0
                     WHEN 'user' THEN 1
                     ELSE 2
                 END
                 LIMIT 1",
                params![name, project_id],
                |row| {
                    let tier: String = row.get(1)?;
                    let raw: String = row.get(2)?;
                    Ok(StoredRule {
                        name: row.get(0)?,
                        tier: match tier.as_str() {
                            "project" => RuleTier::Project,
                            "user" => RuleTier::User,
                            _ => RuleTier::Bundled,
                        },
                        definition: serde_json::from_str(&raw).unwrap_or(Value::Null),
                        project_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tier_precedence() {
        let store = RuleStore::new(Database::open_in_memory().unwrap());
        store
            .put_rule("no-bash", RuleTier::Bundled, &json!({"reason": "bundled"}), None)
            .unwrap();
        store
            .put_rule("no-bash", RuleTier::User, &json!({"reason": "user"}), None)
            .unwrap();

        let rule = store.get_rule("no-bash", None).unwrap().unwrap();
        assert_eq!(rule.tier, RuleTier::User);
        assert_eq!(rule.definition["reason"], json!("user"));

        store
            .put_rule("no-bash", RuleTier::Project, &json!({"reason": "project"}), Some("p1"))
            .unwrap();
        let rule = store.get_rule("no-bash", Some("p1")).unwrap().unwrap();
        assert_eq!(rule.tier, RuleTier::Project);

        // Different project does not see the project-tier rule
        let rule = store.get_rule("no-bash", Some("p2")).unwrap().unwrap();
        assert_eq!(rule.tier, RuleTier::User);
    }

    #[test]
    fn test_missing_rule() {
        let store = RuleStore::new(Database::open_in_memory().unwrap());
        assert!(store.get_rule("missing", None).unwrap().is_none());
    }
}

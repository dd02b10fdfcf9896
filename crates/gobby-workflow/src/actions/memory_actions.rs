//! Memory and skill actions.

use serde_json::Value;
use tracing::{debug, info, warn};

use gobby_types::NewMemory;

use super::{ActionContext, ActionDef, ActionError, ActionOutput, ActionResult, arg_str};

const MEMORY_TYPES: [&str; 4] = ["fact", "preference", "pattern", "context"];

async fn resolve_project_id(ctx: &ActionContext, args: &ActionDef) -> Option<String> {
    if let Some(project_id) = arg_str(args, "project_id") {
        return Some(project_id.to_string());
    }
    ctx.session().await.and_then(|session| session.project_id)
}

/// `memory_inject`: recall project memories above an importance floor and
/// inject them as context.
pub(super) async fn memory_inject(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let Some(memory) = &ctx.services.memory else {
        return Ok(ActionOutput::Empty);
    };
    if !memory.config().enabled {
        return Ok(ActionOutput::Empty);
    }

    let Some(project_id) = resolve_project_id(ctx, args).await else {
        warn!("memory_inject: no project_id found");
        return Ok(ActionOutput::Empty);
    };

    let min_importance = args
        .get("min_importance")
        .and_then(Value::as_f64)
        .unwrap_or(ctx.services.config.memory_min_importance);

    let memories = memory.recall(&project_id, min_importance).await;
    if memories.is_empty() {
        return Ok(ActionOutput::var("injected", Value::Bool(false)));
    }

    let mut lines = vec!["## Project Memory".to_string()];
    for record in &memories {
        lines.push(format!("- [{}] {}", record.memory_type, record.content));
    }
    Ok(ActionOutput::Inject(lines.join("\n")))
}

/// `memory_extract`: LLM-extract memories from the session summary, with
/// dedupe and type/importance clamping.
pub(super) async fn memory_extract(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(memory) = &ctx.services.memory else {
        return Ok(ActionOutput::Empty);
    };
    let config = memory.config();
    if !config.enabled {
        return Ok(ActionOutput::Empty);
    }
    if !config.auto_extract {
        debug!("memory_extract: auto_extract disabled");
        return Ok(ActionOutput::Empty);
    }

    let llm = ctx
        .services
        .llm
        .as_ref()
        .ok_or_else(|| ActionError::new("LLM service not available"))?;
    let Some(session) = ctx.session().await else {
        return Err(ActionError::new("session not found"));
    };
    let Some(project_id) = session.project_id.clone() else {
        return Err(ActionError::new("session has no project"));
    };
    let Some(summary) = session.summary_markdown.clone() else {
        debug!("memory_extract: no summary available, skipping extraction");
        return Ok(ActionOutput::var("extracted", Value::from(0)));
    };

    let (provider, model) = llm
        .provider_for_feature("memory")
        .ok_or_else(|| ActionError::new("no provider for memory feature"))?;

    let prompt = config.extraction_prompt.replace("{summary}", &summary);
    let response = provider
        .generate_text(&prompt, model.as_deref())
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    let Some(entries) = parse_memory_response(&response) else {
        warn!(session_id = %ctx.session_id, "memory_extract: failed to parse LLM response");
        return Ok(ActionOutput::vars([
            ("extracted".to_string(), Value::from(0)),
            ("error".to_string(), Value::String("json_parse_error".into())),
        ]));
    };

    let mut created = 0usize;
    for entry in entries {
        let Some(content) = entry.get("content").and_then(Value::as_str) else {
            continue;
        };
        if memory.content_exists(content, &project_id).await {
            debug!("memory_extract: skipping duplicate");
            continue;
        }

        let memory_type = entry
            .get("memory_type")
            .and_then(Value::as_str)
            .filter(|t| MEMORY_TYPES.contains(t))
            .unwrap_or("fact");
        let importance = entry
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let tags = entry
            .get("tags")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let outcome = memory
            .remember(NewMemory {
                content: content.to_string(),
                memory_type: memory_type.to_string(),
                importance,
                project_id: project_id.clone(),
                source_type: "session".to_string(),
                source_session_id: Some(ctx.session_id.clone()),
                tags,
            })
            .await;
        match outcome {
            Ok(_) => {
                created += 1;
                info!(memory_type, "memory_extract: created memory");
            }
            Err(e) => warn!(error = %e, "memory_extract: failed to create memory"),
        }
    }

    Ok(ActionOutput::var("extracted", Value::from(created as i64)))
}

/// Parse the extraction response: a JSON array, possibly wrapped in a
/// markdown code fence.
fn parse_memory_response(response: &str) -> Option<Vec<Value>> {
    let mut cleaned = response.trim();
    cleaned = cleaned.strip_prefix("```json").unwrap_or(cleaned);
    cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    serde_json::from_str::<Value>(cleaned.trim())
        .ok()?
        .as_array()
        .cloned()
}

/// `skills_learn`: delegate to the skill learner over the session.
pub(super) async fn skills_learn(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(skills) = &ctx.services.skills else {
        return Ok(ActionOutput::Empty);
    };
    if !skills.enabled() {
        return Ok(ActionOutput::Empty);
    }
    let Some(session) = ctx.session().await else {
        return Err(ActionError::new("session not found"));
    };

    let learned = skills
        .learn_from_session(&session)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    Ok(ActionOutput::vars([
        ("skills_learned".to_string(), Value::from(learned.len() as i64)),
        (
            "skill_names".to_string(),
            Value::Array(learned.into_iter().map(Value::String).collect()),
        ),
    ]))
}

/// `memory.sync_import`: filesystem → store.
pub(super) async fn memory_sync_import(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(sync) = &ctx.services.memory_sync else {
        return Err(ActionError::new("memory sync manager not available"));
    };
    let count = sync
        .import_from_files()
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;
    info!(count, "memory sync import complete");
    Ok(ActionOutput::var("imported", Value::from(count as i64)))
}

/// `memory.sync_export`: store → filesystem.
pub(super) async fn memory_sync_export(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    let Some(sync) = &ctx.services.memory_sync else {
        return Err(ActionError::new("memory sync manager not available"));
    };
    let count = sync
        .export_to_files()
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;
    info!(count, "memory sync export complete");
    Ok(ActionOutput::var("exported", Value::from(count as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{args, context_with};
    use crate::actions::Services;
    use async_trait::async_trait;
    use gobby_types::{
        CollabResult, MemoryConfig, MemoryRecord, MemoryStore, SessionRecord, SessionStore,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    struct StubMemory {
        enabled: bool,
        records: Vec<MemoryRecord>,
        remembered: Mutex<Vec<NewMemory>>,
        existing: Vec<String>,
    }

    impl StubMemory {
        fn new(enabled: bool) -> Self {
            Self {
                enabled,
                records: vec![MemoryRecord {
                    id: "m1".into(),
                    content: "prefers tabs".into(),
                    memory_type: "preference".into(),
                    importance: 0.9,
                    tags: vec![],
                }],
                remembered: Mutex::new(Vec::new()),
                existing: vec!["already known".into()],
            }
        }
    }

    #[async_trait]
    impl MemoryStore for StubMemory {
        fn config(&self) -> MemoryConfig {
            MemoryConfig {
                enabled: self.enabled,
                auto_extract: true,
                extraction_prompt: "Extract from: {summary}".into(),
            }
        }
        async fn recall(&self, _project_id: &str, min_importance: f64) -> Vec<MemoryRecord> {
            self.records
                .iter()
                .filter(|r| r.importance >= min_importance)
                .cloned()
                .collect()
        }
        async fn remember(&self, memory: NewMemory) -> CollabResult<MemoryRecord> {
            self.remembered.lock().push(memory.clone());
            Ok(MemoryRecord {
                id: "new".into(),
                content: memory.content,
                memory_type: memory.memory_type,
                importance: memory.importance,
                tags: memory.tags,
            })
        }
        async fn content_exists(&self, content: &str, _project_id: &str) -> bool {
            self.existing.iter().any(|c| c == content)
        }
    }

    struct OneSession;

    #[async_trait]
    impl SessionStore for OneSession {
        async fn get(&self, session_id: &str) -> Option<SessionRecord> {
            Some(SessionRecord {
                id: session_id.to_string(),
                project_id: Some("proj-1".into()),
                status: "active".into(),
                summary_markdown: Some("did things".into()),
                ..Default::default()
            })
        }
        async fn find_by_external_id(
            &self,
            _e: &str,
            _m: &str,
            _p: &str,
            _s: &str,
        ) -> Option<SessionRecord> {
            None
        }
        async fn update_status(&self, _: &str, _: &str) -> CollabResult<()> {
            Ok(())
        }
        async fn update_summary(&self, _: &str, _: &str) -> CollabResult<()> {
            Ok(())
        }
        async fn update_title(&self, _: &str, _: &str) -> CollabResult<()> {
            Ok(())
        }
        async fn update_compact_markdown(&self, _: &str, _: &str) -> CollabResult<()> {
            Ok(())
        }
    }

    struct MemoryJsonProvider;

    #[async_trait]
    impl gobby_types::LlmProvider for MemoryJsonProvider {
        async fn generate_text(&self, _prompt: &str, _model: Option<&str>) -> CollabResult<String> {
            Ok(r#"```json
[
  {"content": "uses rusqlite", "memory_type": "fact", "importance": 1.5},
  {"content": "already known", "memory_type": "fact"},
  {"content": "odd type", "memory_type": "weird"}
]
```"#
                .to_string())
        }
        async fn generate_summary(
            &self,
            _context: &serde_json::Map<String, Value>,
            _template: &str,
        ) -> CollabResult<String> {
            Ok(String::new())
        }
    }

    struct MemoryLlm;

    impl gobby_types::LlmService for MemoryLlm {
        fn default_provider(&self) -> Option<Arc<dyn gobby_types::LlmProvider>> {
            Some(Arc::new(MemoryJsonProvider))
        }
        fn provider_for_feature(
            &self,
            _feature: &str,
        ) -> Option<(Arc<dyn gobby_types::LlmProvider>, Option<String>)> {
            Some((Arc::new(MemoryJsonProvider), None))
        }
    }

    #[tokio::test]
    async fn test_memory_inject() {
        let memory = Arc::new(StubMemory::new(true));
        let ctx = context_with(Services {
            memory: Some(memory),
            sessions: Some(Arc::new(OneSession)),
            ..Default::default()
        });

        let output = memory_inject(&ctx, &args(json!({}))).await.unwrap();
        match output {
            ActionOutput::Inject(content) => {
                assert!(content.contains("## Project Memory"));
                assert!(content.contains("prefers tabs"));
            }
            other => panic!("expected Inject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_inject_disabled() {
        let ctx = context_with(Services {
            memory: Some(Arc::new(StubMemory::new(false))),
            sessions: Some(Arc::new(OneSession)),
            ..Default::default()
        });
        let output = memory_inject(&ctx, &args(json!({}))).await.unwrap();
        assert!(matches!(output, ActionOutput::Empty));
    }

    #[tokio::test]
    async fn test_memory_extract_dedupes_and_clamps() {
        let memory = Arc::new(StubMemory::new(true));
        let ctx = context_with(Services {
            memory: Some(memory.clone()),
            sessions: Some(Arc::new(OneSession)),
            llm: Some(Arc::new(MemoryLlm)),
            ..Default::default()
        });

        let output = memory_extract(&ctx, &args(json!({}))).await.unwrap();
        // "already known" deduped, 2 created
        assert!(matches!(output, ActionOutput::Vars(vars) if vars["extracted"] == json!(2)));

        let remembered = memory.remembered.lock();
        assert_eq!(remembered.len(), 2);
        // importance clamped to 1.0
        assert_eq!(remembered[0].importance, 1.0);
        // unknown type normalized to fact
        assert_eq!(remembered[1].memory_type, "fact");
    }

    #[test]
    fn test_parse_memory_response_fence_handling() {
        assert!(parse_memory_response("[]").unwrap().is_empty());
        assert!(parse_memory_response("```json\n[]\n```").unwrap().is_empty());
        assert!(parse_memory_response("not json").is_none());
        assert!(parse_memory_response("{\"not\": \"a list\"}").is_none());
    }
}

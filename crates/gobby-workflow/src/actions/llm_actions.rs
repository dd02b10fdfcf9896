//! LLM-backed actions: summaries, titles, and handoff context extraction.

use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use gobby_types::{LlmProvider, SessionRecord};

use super::{ActionContext, ActionDef, ActionError, ActionOutput, ActionResult, arg_str};

const DEFAULT_SUMMARY_TEMPLATE: &str = "Summarize this session, focusing on what was \
     accomplished, key decisions, and what is left to do.\n\nTranscript:\n{{ transcript_summary }}";

const DEFAULT_TITLE_TEMPLATE: &str = "Create a short, concise title (3-6 words) for this coding \
     session based on the transcript.\n\nTranscript:\n{{ transcript }}";

fn default_provider(
    ctx: &ActionContext,
) -> Result<std::sync::Arc<dyn LlmProvider>, ActionError> {
    ctx.services
        .llm
        .as_ref()
        .and_then(|llm| llm.default_provider())
        .ok_or_else(|| ActionError::new("LLM service not available"))
}

async fn require_session(ctx: &ActionContext) -> Result<SessionRecord, ActionError> {
    ctx.session()
        .await
        .ok_or_else(|| ActionError::new("session not found"))
}

/// `call_llm`: render a prompt, call the default provider, store the result
/// in a variable.
pub(super) async fn call_llm(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let (Some(prompt), Some(output_as)) = (arg_str(args, "prompt"), arg_str(args, "output_as"))
    else {
        return Err(ActionError::new("missing prompt or output_as"));
    };
    let provider = default_provider(ctx)?;

    let mut render_ctx = ctx.render_context().await;
    for (key, value) in args {
        render_ctx.entry(key.clone()).or_insert_with(|| value.clone());
    }
    let rendered = ctx.template.render(prompt, &render_ctx)?;

    let response = provider
        .generate_text(&rendered, arg_str(args, "model"))
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    ctx.set_variable(output_as, Value::String(response));
    Ok(ActionOutput::vars([
        ("llm_called".to_string(), Value::Bool(true)),
        ("output_variable".to_string(), Value::String(output_as.into())),
    ]))
}

/// `synthesize_title`: read the opening transcript turns, prompt the LLM,
/// and set the session title.
pub(super) async fn synthesize_title(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let provider = default_provider(ctx)?;
    let session = require_session(ctx).await?;
    let sessions = ctx
        .services
        .sessions
        .as_ref()
        .ok_or_else(|| ActionError::new("session store not available"))?;

    let transcript_path = session
        .transcript_path
        .as_ref()
        .ok_or_else(|| ActionError::new("no transcript path"))?;
    let turns = read_transcript(transcript_path, Some(20))?;
    if turns.is_empty() {
        return Err(ActionError::new("empty transcript"));
    }

    let template = arg_str(args, "template").unwrap_or(DEFAULT_TITLE_TEMPLATE);
    let mut render_ctx = Map::new();
    render_ctx.insert(
        "transcript".into(),
        Value::String(format_turns_for_llm(&turns)),
    );
    let prompt = ctx.template.render(template, &render_ctx)?;

    let raw_title = provider
        .generate_text(&prompt, None)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;
    let title = raw_title.trim().trim_matches(['"', '\'']).to_string();

    sessions
        .update_title(&ctx.session_id, &title)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;
    Ok(ActionOutput::var("title_synthesized", Value::String(title)))
}

/// `generate_summary`: summarize the session transcript via the LLM and
/// store the result on the session record.
pub(super) async fn generate_summary(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let provider = default_provider(ctx)?;
    let session = require_session(ctx).await?;
    let sessions = ctx
        .services
        .sessions
        .as_ref()
        .ok_or_else(|| ActionError::new("session store not available"))?;

    let transcript_path = session
        .transcript_path
        .as_ref()
        .ok_or_else(|| ActionError::new("no transcript path"))?;
    let turns = read_transcript(transcript_path, Some(50))?;

    let template = arg_str(args, "template").unwrap_or(DEFAULT_SUMMARY_TEMPLATE);

    let mut llm_context = Map::new();
    llm_context.insert(
        "transcript_summary".into(),
        Value::String(format_turns_for_llm(&turns)),
    );
    llm_context.insert(
        "last_messages".into(),
        Value::String(format_turns_for_llm(last_turns(&turns, 4))),
    );
    llm_context.insert(
        "session".into(),
        serde_json::to_value(&session).unwrap_or(Value::Null),
    );
    llm_context.insert("git_status".into(), Value::String(git_status().await));
    llm_context.insert("file_changes".into(), Value::String(git_file_changes().await));

    let summary = provider
        .generate_summary(&llm_context, template)
        .await
        .map_err(|e| ActionError::new(format!("LLM error: {e}")))?;

    sessions
        .update_summary(&ctx.session_id, &summary)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    info!(session_id = %ctx.session_id, "generated session summary");
    Ok(ActionOutput::vars([
        ("summary_generated".to_string(), Value::Bool(true)),
        ("summary_length".to_string(), Value::from(summary.len() as i64)),
    ]))
}

/// `generate_handoff`: generate a summary and flip the session status to
/// `handoff_ready`.
pub(super) async fn generate_handoff(ctx: &ActionContext, args: &ActionDef) -> ActionResult {
    let summary_output = generate_summary(ctx, args).await?;

    let sessions = ctx
        .services
        .sessions
        .as_ref()
        .ok_or_else(|| ActionError::new("session store not available"))?;
    sessions
        .update_status(&ctx.session_id, "handoff_ready")
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    Ok(ActionOutput::Multi(vec![
        summary_output,
        ActionOutput::var("handoff_created", Value::Bool(true)),
    ]))
}

/// `extract_handoff_context`: parse the transcript plus live git state into
/// a compact markdown continuation context and persist it to the session.
pub(super) async fn extract_handoff_context(ctx: &ActionContext, _args: &ActionDef) -> ActionResult {
    if !ctx.services.config.compact_handoff_enabled {
        return Ok(ActionOutput::var("skipped", Value::String("compact_handoff disabled".into())));
    }

    let session = require_session(ctx).await?;
    let sessions = ctx
        .services
        .sessions
        .as_ref()
        .ok_or_else(|| ActionError::new("session store not available"))?;
    let transcript_path = session
        .transcript_path
        .as_ref()
        .ok_or_else(|| ActionError::new("no transcript path"))?;

    let turns = read_transcript(transcript_path, None)?;
    let mut handoff = HandoffContext::from_turns(&turns);

    // Live git state is more reliable than whatever the transcript mentions.
    if handoff.git_status.is_empty() {
        handoff.git_status = git_status().await;
    }
    let commits = git_recent_commits(10).await;
    if !commits.is_empty() {
        handoff.git_commits = commits;
    }

    let markdown = handoff.to_markdown(ctx.services.config.compact_handoff_prompt.as_deref());

    sessions
        .update_compact_markdown(&ctx.session_id, &markdown)
        .await
        .map_err(|e| ActionError::new(e.to_string()))?;

    info!(
        session_id = %ctx.session_id,
        length = markdown.len(),
        "saved compact handoff context"
    );
    Ok(ActionOutput::vars([
        ("handoff_context_extracted".to_string(), Value::Bool(true)),
        ("markdown_length".to_string(), Value::from(markdown.len() as i64)),
    ]))
}

// ── Handoff context assembly ────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct HandoffContext {
    pub initial_goal: String,
    pub files_modified: Vec<String>,
    pub todo_state: Vec<Map<String, Value>>,
    pub recent_activity: Vec<String>,
    pub git_status: String,
    pub git_commits: Vec<(String, String)>,
}

impl HandoffContext {
    /// Scan transcript turns for the pieces a continuation needs: the first
    /// user goal, files touched by Edit/Write, the last TodoWrite state, and
    /// recent tool activity.
    pub(crate) fn from_turns(turns: &[Value]) -> Self {
        let mut context = HandoffContext::default();

        for turn in turns {
            let message = turn.get("message").and_then(Value::as_object);
            let role = message
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
                .unwrap_or_default();

            if role == "user" && context.initial_goal.is_empty() {
                if let Some(text) = message
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                {
                    context.initial_goal = text.chars().take(500).collect();
                }
            }

            let Some(blocks) = message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for block in blocks {
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    continue;
                }
                let tool = block.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = block.get("input").and_then(Value::as_object);

                match tool {
                    "Edit" | "Write" => {
                        if let Some(file) = input
                            .and_then(|i| i.get("file_path"))
                            .and_then(Value::as_str)
                        {
                            if !context.files_modified.iter().any(|f| f == file) {
                                context.files_modified.push(file.to_string());
                            }
                        }
                    }
                    "TodoWrite" => {
                        if let Some(todos) = input
                            .and_then(|i| i.get("todos"))
                            .and_then(Value::as_array)
                        {
                            context.todo_state = todos
                                .iter()
                                .filter_map(Value::as_object)
                                .cloned()
                                .collect();
                        }
                    }
                    _ => {}
                }
                context.recent_activity.push(tool.to_string());
            }
        }

        context
    }

    pub(crate) fn to_markdown(&self, prompt_template: Option<&str>) -> String {
        let mut sections: Map<String, Value> = Map::new();

        let todo_section = if self.todo_state.is_empty() {
            String::new()
        } else {
            let mut lines = vec!["### In-Progress Work".to_string()];
            for todo in &self.todo_state {
                let status = todo.get("status").and_then(Value::as_str).unwrap_or("pending");
                let marker = match status {
                    "completed" => "x",
                    "in_progress" => ">",
                    _ => " ",
                };
                let content = todo.get("content").and_then(Value::as_str).unwrap_or_default();
                lines.push(format!("- [{marker}] {content}"));
            }
            lines.join("\n") + "\n"
        };
        sections.insert("todo_state_section".into(), Value::String(todo_section));

        let commits_section = if self.git_commits.is_empty() {
            String::new()
        } else {
            let mut lines = vec!["### Commits This Session".to_string()];
            for (hash, message) in &self.git_commits {
                let short: String = hash.chars().take(7).collect();
                lines.push(format!("- `{short}` {message}"));
            }
            lines.join("\n") + "\n"
        };
        sections.insert("git_commits_section".into(), Value::String(commits_section));

        let status_section = if self.git_status.is_empty() {
            String::new()
        } else {
            format!("### Uncommitted Changes\n```\n{}\n```\n", self.git_status)
        };
        sections.insert("git_status_section".into(), Value::String(status_section));

        let files_section = if self.files_modified.is_empty() {
            String::new()
        } else {
            let mut lines = vec!["### Files Being Modified".to_string()];
            for file in &self.files_modified {
                lines.push(format!("- {file}"));
            }
            lines.join("\n") + "\n"
        };
        sections.insert("files_modified_section".into(), Value::String(files_section));

        let goal_section = if self.initial_goal.is_empty() {
            String::new()
        } else {
            format!("### Original Goal\n{}\n", self.initial_goal)
        };
        sections.insert("initial_goal_section".into(), Value::String(goal_section));

        let activity_section = if self.recent_activity.is_empty() {
            String::new()
        } else {
            let mut lines = vec!["### Recent Activity".to_string()];
            for activity in self.recent_activity.iter().rev().take(5).rev() {
                lines.push(format!("- {activity}"));
            }
            lines.join("\n") + "\n"
        };
        sections.insert("recent_activity_section".into(), Value::String(activity_section));

        if let Some(template) = prompt_template {
            let mut rendered = template.to_string();
            for (name, section) in &sections {
                let placeholder = format!("{{{name}}}");
                rendered = rendered.replace(&placeholder, section.as_str().unwrap_or(""));
            }
            let collapsed = collapse_blank_lines(&rendered);
            if !collapsed.trim().is_empty() {
                return collapsed.trim().to_string() + "\n";
            }
        }

        let mut lines = vec!["## Continuation Context".to_string(), String::new()];
        for key in [
            "todo_state_section",
            "git_commits_section",
            "git_status_section",
            "files_modified_section",
            "initial_goal_section",
            "recent_activity_section",
        ] {
            let section = sections[key].as_str().unwrap_or("");
            if !section.is_empty() {
                lines.push(section.to_string());
            }
        }
        lines.join("\n")
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        result.push_str(line);
        result.push('\n');
    }
    result
}

// ── Transcript helpers ──────────────────────────────────────────────────

pub(crate) fn read_transcript(
    path: &Path,
    max_turns: Option<usize>,
) -> Result<Vec<Value>, ActionError> {
    if !path.exists() {
        return Err(ActionError::new(format!(
            "transcript not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ActionError::new(format!("failed to read transcript: {e}")))?;

    let mut turns = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(turn) => turns.push(turn),
            Err(e) => warn!(error = %e, "skipping malformed transcript line"),
        }
        if let Some(limit) = max_turns {
            if turns.len() >= limit {
                break;
            }
        }
    }
    Ok(turns)
}

fn last_turns(turns: &[Value], count: usize) -> &[Value] {
    &turns[turns.len().saturating_sub(count)..]
}

/// Format transcript turns for LLM analysis: one `[Turn N - role]` line per
/// turn, with assistant content blocks flattened.
pub(crate) fn format_turns_for_llm(turns: &[Value]) -> String {
    let mut formatted = Vec::with_capacity(turns.len());
    for (index, turn) in turns.iter().enumerate() {
        let message = turn.get("message").and_then(Value::as_object);
        let role = message
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let content = message.and_then(|m| m.get("content"));

        let text = match content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(blocks)) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            parts.push(
                                block.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
                            );
                        }
                        Some("thinking") => {
                            parts.push(format!(
                                "[Thinking: {}]",
                                block.get("thinking").and_then(Value::as_str).unwrap_or("")
                            ));
                        }
                        Some("tool_use") => {
                            parts.push(format!(
                                "[Tool: {}]",
                                block.get("name").and_then(Value::as_str).unwrap_or("unknown")
                            ));
                        }
                        _ => {}
                    }
                }
                parts.join(" ")
            }
            _ => String::new(),
        };

        formatted.push(format!("[Turn {} - {role}]: {text}", index + 1));
    }
    formatted.join("\n\n")
}

// ── Git helpers ─────────────────────────────────────────────────────────

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_git(args: &[&str]) -> Option<String> {
    let command = tokio::process::Command::new("git")
        .args(args)
        .stdin(std::process::Stdio::null())
        .output();
    match tokio::time::timeout(GIT_TIMEOUT, command).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        _ => None,
    }
}

pub(crate) async fn git_status() -> String {
    match run_git(&["status", "--short"]).await {
        Some(status) if !status.is_empty() => status,
        Some(_) => "No changes".to_string(),
        None => "Not a git repository or git not available".to_string(),
    }
}

pub(crate) async fn git_recent_commits(max_commits: usize) -> Vec<(String, String)> {
    let Some(log) = run_git(&["log", &format!("-{max_commits}"), "--format=%H|%s"]).await else {
        return Vec::new();
    };
    log.lines()
        .filter_map(|line| {
            line.split_once('|')
                .map(|(hash, message)| (hash.to_string(), message.to_string()))
        })
        .collect()
}

pub(crate) async fn git_file_changes() -> String {
    let mut changes = Vec::new();
    if let Some(diff) = run_git(&["diff", "HEAD", "--name-status"]).await {
        if !diff.is_empty() {
            changes.push(format!("Modified/Deleted:\n{diff}"));
        }
    }
    if let Some(untracked) = run_git(&["ls-files", "--others", "--exclude-standard"]).await {
        if !untracked.is_empty() {
            changes.push(format!("Untracked:\n{untracked}"));
        }
    }
    if changes.is_empty() {
        "No changes".to_string()
    } else {
        changes.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{args, context_with};
    use crate::actions::Services;
    use async_trait::async_trait;
    use gobby_types::{CollabResult, LlmService, SessionStore};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn generate_text(&self, prompt: &str, _model: Option<&str>) -> CollabResult<String> {
            Ok(format!("echo: {prompt}"))
        }
        async fn generate_summary(
            &self,
            _context: &Map<String, Value>,
            _template: &str,
        ) -> CollabResult<String> {
            Ok("the summary".to_string())
        }
    }

    struct EchoService;

    impl LlmService for EchoService {
        fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
            Some(Arc::new(EchoProvider))
        }
        fn provider_for_feature(
            &self,
            _feature: &str,
        ) -> Option<(Arc<dyn LlmProvider>, Option<String>)> {
            Some((Arc::new(EchoProvider), None))
        }
    }

    #[derive(Default)]
    struct RecordingSessions {
        pub record: Mutex<Option<gobby_types::SessionRecord>>,
        pub updates: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SessionStore for RecordingSessions {
        async fn get(&self, _session_id: &str) -> Option<gobby_types::SessionRecord> {
            self.record.lock().clone()
        }
        async fn find_by_external_id(
            &self,
            _e: &str,
            _m: &str,
            _p: &str,
            _s: &str,
        ) -> Option<gobby_types::SessionRecord> {
            None
        }
        async fn update_status(&self, _id: &str, status: &str) -> CollabResult<()> {
            self.updates.lock().push(("status".into(), status.into()));
            Ok(())
        }
        async fn update_summary(&self, _id: &str, markdown: &str) -> CollabResult<()> {
            self.updates.lock().push(("summary".into(), markdown.into()));
            Ok(())
        }
        async fn update_title(&self, _id: &str, title: &str) -> CollabResult<()> {
            self.updates.lock().push(("title".into(), title.into()));
            Ok(())
        }
        async fn update_compact_markdown(&self, _id: &str, markdown: &str) -> CollabResult<()> {
            self.updates.lock().push(("compact".into(), markdown.into()));
            Ok(())
        }
    }

    fn transcript_file(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("transcript.jsonl");
        let lines = [
            json!({"message": {"role": "user", "content": "build the widget"}}),
            json!({"message": {"role": "assistant", "content": [
                {"type": "text", "text": "on it"},
                {"type": "tool_use", "name": "Edit", "input": {"file_path": "src/widget.rs"}}
            ]}}),
            json!({"message": {"role": "assistant", "content": [
                {"type": "tool_use", "name": "TodoWrite", "input": {"todos": [
                    {"content": "wire the widget", "status": "in_progress"}
                ]}}
            ]}}),
        ];
        let content: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        std::fs::write(&path, content.join("\n")).unwrap();
        path
    }

    fn services_with_transcript(dir: &std::path::Path) -> (Services, Arc<RecordingSessions>) {
        let sessions = Arc::new(RecordingSessions::default());
        *sessions.record.lock() = Some(gobby_types::SessionRecord {
            id: "sess-1".into(),
            status: "active".into(),
            transcript_path: Some(transcript_file(dir)),
            ..Default::default()
        });
        let services = Services {
            sessions: Some(sessions.clone()),
            llm: Some(Arc::new(EchoService)),
            ..Default::default()
        };
        (services, sessions)
    }

    #[tokio::test]
    async fn test_call_llm_stores_variable() {
        let ctx = context_with(Services {
            llm: Some(Arc::new(EchoService)),
            ..Default::default()
        });
        ctx.set_variable("topic", json!("caching"));
        let output = call_llm(
            &ctx,
            &args(json!({"prompt": "explain {{ variables.topic }}", "output_as": "explanation"})),
        )
        .await
        .unwrap();
        assert!(matches!(output, ActionOutput::Vars(_)));
        assert_eq!(ctx.variables()["explanation"], json!("echo: explain caching"));
    }

    #[tokio::test]
    async fn test_call_llm_without_service_errors() {
        let ctx = context_with(Services::default());
        let err = call_llm(&ctx, &args(json!({"prompt": "x", "output_as": "y"})))
            .await
            .unwrap_err();
        assert!(err.0.contains("LLM service"));
    }

    #[tokio::test]
    async fn test_generate_summary_updates_session() {
        let dir = tempfile::tempdir().unwrap();
        let (services, sessions) = services_with_transcript(dir.path());
        let ctx = context_with(services);

        let output = generate_summary(&ctx, &args(json!({}))).await.unwrap();
        let mut effects = crate::actions::ActionEffects::default();
        effects.absorb(output);
        assert_eq!(effects.vars["summary_generated"], json!(true));

        let updates = sessions.updates.lock();
        assert!(updates.iter().any(|(kind, v)| kind == "summary" && v == "the summary"));
    }

    #[tokio::test]
    async fn test_generate_handoff_flips_status() {
        let dir = tempfile::tempdir().unwrap();
        let (services, sessions) = services_with_transcript(dir.path());
        let ctx = context_with(services);

        generate_handoff(&ctx, &args(json!({}))).await.unwrap();
        let updates = sessions.updates.lock();
        assert!(updates.iter().any(|(kind, v)| kind == "status" && v == "handoff_ready"));
    }

    #[tokio::test]
    async fn test_synthesize_title() {
        let dir = tempfile::tempdir().unwrap();
        let (services, sessions) = services_with_transcript(dir.path());
        let ctx = context_with(services);

        synthesize_title(&ctx, &args(json!({}))).await.unwrap();
        let updates = sessions.updates.lock();
        assert!(updates.iter().any(|(kind, _)| kind == "title"));
    }

    #[tokio::test]
    async fn test_extract_handoff_context_builds_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let (services, sessions) = services_with_transcript(dir.path());
        let ctx = context_with(services);

        extract_handoff_context(&ctx, &args(json!({}))).await.unwrap();
        let updates = sessions.updates.lock();
        let (_, markdown) = updates.iter().find(|(kind, _)| kind == "compact").unwrap();
        assert!(markdown.contains("### Original Goal"));
        assert!(markdown.contains("build the widget"));
        assert!(markdown.contains("- [>] wire the widget"));
        assert!(markdown.contains("src/widget.rs"));
    }

    #[tokio::test]
    async fn test_extract_handoff_disabled() {
        let services = Services {
            config: crate::actions::ActionConfig {
                compact_handoff_enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = context_with(services);
        let output = extract_handoff_context(&ctx, &args(json!({}))).await.unwrap();
        assert!(matches!(output, ActionOutput::Vars(vars) if vars.contains_key("skipped")));
    }

    #[test]
    fn test_format_turns() {
        let turns = vec![
            json!({"message": {"role": "user", "content": "hi"}}),
            json!({"message": {"role": "assistant", "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "name": "Read"}
            ]}}),
        ];
        let formatted = format_turns_for_llm(&turns);
        assert!(formatted.contains("[Turn 1 - user]: hi"));
        assert!(formatted.contains("[Turn 2 - assistant]: hello [Tool: Read]"));
    }

    #[test]
    fn test_handoff_context_custom_template() {
        let mut handoff = HandoffContext::default();
        handoff.initial_goal = "fix the bug".into();
        let markdown = handoff.to_markdown(Some("GOAL:\n{initial_goal_section}\n\n\n\nEND"));
        assert!(markdown.contains("fix the bug"));
        // Blank-line runs collapsed
        assert!(!markdown.contains("\n\n\n"));
    }
}

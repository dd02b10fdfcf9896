//! String-template rendering for workflows.
//!
//! Actions own rendering: the engine never implicitly renders YAML strings.
//! Templates see the caller-provided context (`{{ variables.x }}`,
//! conditionals, loops) plus one extra filter, `regex_search`, for pulling a
//! capture group out of text. Markup escaping is off: workflows generate
//! markdown, and escaping breaks apostrophes.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tera::Tera;

use crate::error::{Result, WorkflowError};

/// Tera filter: extract a regex capture group from text.
///
/// `{{ text | regex_search(pattern='version (\d+)') }}` returns group 1 by
/// default, or group 0 when the requested group does not exist, or the empty
/// string when nothing matches.
fn regex_search(
    value: &tera::Value,
    args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let text = match value {
        tera::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let pattern = args
        .get("pattern")
        .and_then(tera::Value::as_str)
        .ok_or_else(|| tera::Error::msg("regex_search requires a 'pattern' argument"))?;
    let group = args
        .get("group")
        .and_then(tera::Value::as_u64)
        .unwrap_or(1) as usize;

    let re = regex::Regex::new(pattern)
        .map_err(|e| tera::Error::msg(format!("invalid regex '{pattern}': {e}")))?;

    let extracted = match re.captures(&text) {
        Some(caps) => caps
            .get(group)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        None => String::new(),
    };
    Ok(tera::Value::String(extracted))
}

/// Renders inline workflow templates.
#[derive(Clone, Default)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    /// Render a template string with the given context. Render failures fail
    /// the calling action, not the event.
    pub fn render(&self, template: &str, context: &Map<String, Value>) -> Result<String> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_filter("regex_search", regex_search);

        let mut ctx = tera::Context::new();
        for (key, value) in context {
            ctx.insert(key.as_str(), value);
        }

        tera.render_str(template, &ctx)
            .map_err(|e| WorkflowError::Template(flatten_tera_error(&e)))
    }
}

fn flatten_tera_error(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_render_variable_path() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render(
                "task {{ variables.task_id }} in step {{ step }}",
                &ctx(json!({"variables": {"task_id": "t-1"}, "step": "implement"})),
            )
            .unwrap();
        assert_eq!(rendered, "task t-1 in step implement");
    }

    #[test]
    fn test_render_conditional_and_loop() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render(
                "{% if items %}{% for i in items %}- {{ i }}\n{% endfor %}{% else %}none{% endif %}",
                &ctx(json!({"items": ["a", "b"]})),
            )
            .unwrap();
        assert_eq!(rendered, "- a\n- b\n");
    }

    #[test]
    fn test_no_html_escaping() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render("{{ text }}", &ctx(json!({"text": "don't <escape> & this"})))
            .unwrap();
        assert_eq!(rendered, "don't <escape> & this");
    }

    #[test]
    fn test_regex_search_filter() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render(
                r#"{{ text | regex_search(pattern='library ID: (/\S+)') }}"#,
                &ctx(json!({"text": "resolved library ID: /vercel/next.js for docs"})),
            )
            .unwrap();
        assert_eq!(rendered, "/vercel/next.js");
    }

    #[test]
    fn test_regex_search_no_match_is_empty() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render(
                "{{ text | regex_search(pattern='nope (x)') }}",
                &ctx(json!({"text": "nothing here"})),
            )
            .unwrap();
        assert_eq!(rendered, "");
    }

    #[test]
    fn test_render_failure_is_error() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{ unclosed", &ctx(json!({})));
        assert!(result.is_err());
    }
}

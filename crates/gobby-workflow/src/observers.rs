//! Observer evaluation and the behavior registry.
//!
//! Observers watch events and mutate workflow variables. The YAML variant
//! matches on event name plus optional tool/MCP predicates, then evaluates
//! each `set` entry as a template expression; the behavior variant delegates
//! to a registered async callable. Observers run once per event per
//! workflow, after triggers, and their failures are logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use gobby_types::{Behavior, HookEvent};

use crate::definitions::Observer;
use crate::template::TemplateEngine;

/// Registry mapping behavior names to async callables.
///
/// Built-in behaviors are registered at startup and are write-protected:
/// plugins cannot override them or re-register an existing name.
#[derive(Default)]
pub struct BehaviorRegistry {
    behaviors: RwLock<HashMap<String, Arc<dyn Behavior>>>,
    builtin_names: RwLock<std::collections::HashSet<String>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in behavior.
    pub fn register(&self, name: impl Into<String>, behavior: Arc<dyn Behavior>) {
        let name = name.into();
        self.builtin_names.write().insert(name.clone());
        self.behaviors.write().insert(name, behavior);
    }

    /// Register a plugin-provided behavior. Rejected when the name collides
    /// with a built-in or an already-registered plugin behavior.
    pub fn register_plugin_behavior(
        &self,
        name: impl Into<String>,
        behavior: Arc<dyn Behavior>,
    ) -> Result<(), String> {
        let name = name.into();
        if self.builtin_names.read().contains(&name) {
            return Err(format!(
                "Cannot register plugin behavior '{name}': conflicts with built-in behavior"
            ));
        }
        let mut behaviors = self.behaviors.write();
        if behaviors.contains_key(&name) {
            return Err(format!(
                "Cannot register plugin behavior '{name}': already registered"
            ));
        }
        behaviors.insert(name, behavior);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Behavior>> {
        self.behaviors.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.behaviors.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.behaviors.read().keys().cloned().collect()
    }

    pub fn builtin_names(&self) -> Vec<String> {
        self.builtin_names.read().iter().cloned().collect()
    }
}

/// Evaluates YAML observers and behavior observers against events.
pub struct ObserverEngine {
    behavior_registry: Option<Arc<BehaviorRegistry>>,
    template_engine: TemplateEngine,
}

impl ObserverEngine {
    pub fn new(behavior_registry: Option<Arc<BehaviorRegistry>>) -> Self {
        Self {
            behavior_registry,
            template_engine: TemplateEngine::new(),
        }
    }

    /// Evaluate all observers against an event, updating `variables` in
    /// place.
    pub async fn evaluate_observers(
        &self,
        observers: &[Observer],
        event: &HookEvent,
        variables: &mut Map<String, Value>,
    ) {
        for observer in observers {
            if observer.behavior.is_some() {
                self.evaluate_behavior(observer, event, variables).await;
            } else {
                self.evaluate_yaml_observer(observer, event, variables);
            }
        }
    }

    async fn evaluate_behavior(
        &self,
        observer: &Observer,
        event: &HookEvent,
        variables: &mut Map<String, Value>,
    ) {
        let behavior_name = observer.behavior.as_deref().unwrap_or_default();
        let Some(registry) = &self.behavior_registry else {
            debug!(observer = %observer.name, "no behavior registry, skipping");
            return;
        };
        let Some(behavior) = registry.get(behavior_name) else {
            warn!(
                observer = %observer.name,
                behavior = behavior_name,
                "behavior not found in registry"
            );
            return;
        };

        if let Err(e) = behavior.run(event, variables).await {
            error!(
                observer = %observer.name,
                behavior = behavior_name,
                error = %e,
                "behavior failed"
            );
        }
    }

    fn evaluate_yaml_observer(
        &self,
        observer: &Observer,
        event: &HookEvent,
        variables: &mut Map<String, Value>,
    ) {
        if observer.on.as_deref() != Some(event.event_type.event_name()) {
            return;
        }
        if !self.matches(observer, event) {
            return;
        }
        let Some(assignments) = &observer.set else {
            return;
        };

        for (var_name, expression) in assignments {
            let Some(expression) = expression.as_str() else {
                // Non-string set values are literals already.
                variables.insert(var_name.clone(), expression.clone());
                continue;
            };
            match self.evaluate_expression(expression, event, variables) {
                Ok(value) => {
                    variables.insert(var_name.clone(), value);
                }
                Err(e) => {
                    warn!(
                        observer = %observer.name,
                        variable = %var_name,
                        error = %e,
                        "failed to evaluate set expression"
                    );
                }
            }
        }
    }

    /// All specified match fields must agree (AND); no match dict matches
    /// everything.
    fn matches(&self, observer: &Observer, event: &HookEvent) -> bool {
        let Some(matcher) = &observer.matcher else {
            return true;
        };

        if let Some(expected) = matcher.get("tool").and_then(Value::as_str) {
            if event.tool_name() != Some(expected) {
                return false;
            }
        }
        if let Some(expected) = matcher.get("mcp_server").and_then(Value::as_str) {
            let server = event.mcp_server().or_else(|| {
                event
                    .tool_input()
                    .and_then(|input| input.get("server_name").or_else(|| input.get("server")))
                    .and_then(Value::as_str)
            });
            if server != Some(expected) {
                return false;
            }
        }
        if let Some(expected) = matcher.get("mcp_tool").and_then(Value::as_str) {
            let tool = event.mcp_tool().or_else(|| {
                event
                    .tool_input()
                    .and_then(|input| input.get("tool_name").or_else(|| input.get("tool")))
                    .and_then(Value::as_str)
            });
            if tool != Some(expected) {
                return false;
            }
        }
        true
    }

    /// Render a set expression and coerce the result. Strings without
    /// template markers pass through as literals; rendered strings coerce
    /// booleans, null, and numbers to native values.
    fn evaluate_expression(
        &self,
        expression: &str,
        event: &HookEvent,
        variables: &Map<String, Value>,
    ) -> crate::error::Result<Value> {
        let raw = if expression.contains("{{") || expression.contains("{%") {
            let mut context = Map::new();
            context.insert("variables".into(), Value::Object(variables.clone()));
            context.insert("event_data".into(), Value::Object(event.data.clone()));
            self.template_engine.render(expression, &context)?
        } else {
            expression.to_string()
        };
        Ok(coerce_value(&raw))
    }
}

/// Coerce rendered string literals to native values: `"true"`/`"false"` →
/// bool, `"null"`/`"none"` → null, numeric strings → numbers, everything
/// else passes through.
pub fn coerce_value(raw: &str) -> Value {
    match raw.trim().to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = raw.trim().parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = raw.trim().parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gobby_types::{CollabResult, HookEventType};
    use serde_json::json;

    fn observer(yaml: &str) -> Observer {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn after_tool_event(tool: &str) -> HookEvent {
        let mut event = HookEvent::new(HookEventType::AfterTool);
        event.data.insert("tool_name".into(), json!(tool));
        event
    }

    #[test]
    fn test_coerce_value() {
        assert_eq!(coerce_value("true"), json!(true));
        assert_eq!(coerce_value("False"), json!(false));
        assert_eq!(coerce_value("null"), Value::Null);
        assert_eq!(coerce_value("none"), Value::Null);
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("2.5"), json!(2.5));
        assert_eq!(coerce_value("plain text"), json!("plain text"));
    }

    #[tokio::test]
    async fn test_yaml_observer_sets_variable() {
        let engine = ObserverEngine::new(None);
        let obs = observer(
            r#"
name: track-edits
on: after_tool
match:
  tool: Edit
set:
  edited: "true"
  last_tool: "{{ event_data.tool_name }}"
"#,
        );
        let mut variables = Map::new();
        engine
            .evaluate_observers(&[obs], &after_tool_event("Edit"), &mut variables)
            .await;
        assert_eq!(variables["edited"], json!(true));
        assert_eq!(variables["last_tool"], json!("Edit"));
    }

    #[tokio::test]
    async fn test_yaml_observer_event_mismatch() {
        let engine = ObserverEngine::new(None);
        let obs = observer("name: x\non: before_tool\nset:\n  hit: 'true'\n");
        let mut variables = Map::new();
        engine
            .evaluate_observers(&[obs], &after_tool_event("Edit"), &mut variables)
            .await;
        assert!(variables.is_empty());
    }

    #[tokio::test]
    async fn test_yaml_observer_match_predicates() {
        let engine = ObserverEngine::new(None);
        let obs = observer(
            r#"
name: mcp-watch
on: after_tool
match:
  mcp_server: gobby-memory
  mcp_tool: recall
set:
  recalled: "true"
"#,
        );

        let mut event = after_tool_event("call_tool");
        event.data.insert("mcp_server".into(), json!("gobby-memory"));
        event.data.insert("mcp_tool".into(), json!("recall"));
        let mut variables = Map::new();
        engine.evaluate_observers(std::slice::from_ref(&obs), &event, &mut variables).await;
        assert_eq!(variables["recalled"], json!(true));

        // Wrong server → no match
        let mut event = after_tool_event("call_tool");
        event.data.insert("mcp_server".into(), json!("other"));
        event.data.insert("mcp_tool".into(), json!("recall"));
        let mut variables = Map::new();
        engine.evaluate_observers(&[obs], &event, &mut variables).await;
        assert!(variables.is_empty());
    }

    struct CountingBehavior;

    #[async_trait]
    impl Behavior for CountingBehavior {
        async fn run(
            &self,
            _event: &HookEvent,
            variables: &mut Map<String, Value>,
        ) -> CollabResult<()> {
            let count = variables.get("count").and_then(Value::as_i64).unwrap_or(0);
            variables.insert("count".into(), json!(count + 1));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_behavior_observer() {
        let registry = Arc::new(BehaviorRegistry::new());
        registry.register("counter", Arc::new(CountingBehavior));
        let engine = ObserverEngine::new(Some(registry));

        let obs = observer("name: counting\nbehavior: counter\n");
        let mut variables = Map::new();
        engine
            .evaluate_observers(&[obs], &after_tool_event("Edit"), &mut variables)
            .await;
        assert_eq!(variables["count"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_behavior_is_swallowed() {
        let registry = Arc::new(BehaviorRegistry::new());
        let engine = ObserverEngine::new(Some(registry));
        let obs = observer("name: ghost\nbehavior: missing\n");
        let mut variables = Map::new();
        engine
            .evaluate_observers(&[obs], &after_tool_event("Edit"), &mut variables)
            .await;
        assert!(variables.is_empty());
    }

    #[test]
    fn test_plugin_registration_protections() {
        let registry = BehaviorRegistry::new();
        registry.register("builtin", Arc::new(CountingBehavior));

        let err = registry
            .register_plugin_behavior("builtin", Arc::new(CountingBehavior))
            .unwrap_err();
        assert!(err.contains("built-in"));

        registry
            .register_plugin_behavior("custom", Arc::new(CountingBehavior))
            .unwrap();
        let err = registry
            .register_plugin_behavior("custom", Arc::new(CountingBehavior))
            .unwrap_err();
        assert!(err.contains("already registered"));

        assert!(registry.has("builtin"));
        assert!(registry.has("custom"));
    }
}

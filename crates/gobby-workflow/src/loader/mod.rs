//! Workflow and pipeline loading.
//!
//! Workflows are YAML files resolved through three roots: the project
//! (`{project}/.gobby/workflows/`), the user directory
//! (`~/.gobby/workflows/` by default), and an optional bundled directory
//! shipped with the product. Loading handles `extends` inheritance with
//! cycle detection, cross-file rule `imports`, qualified
//! (`agent:workflow`) names, and pipeline auto-detection. Loaded
//! definitions are cached per `(project, name)` and invalidated when the
//! backing file's mtime changes.

pub mod discovery;
pub mod validate;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use gobby_types::{AgentWorkflowSource, WorkflowSpec};

use crate::definitions::{AnyDefinition, PipelineDefinition, WorkflowDefinition};
use crate::error::{Result, WorkflowError};

pub use discovery::DiscoveredWorkflow;

/// Relative directory for project workflows.
pub const PROJECT_WORKFLOW_DIR: &str = ".gobby/workflows";

/// Relative directory for project rules.
pub const PROJECT_RULE_DIR: &str = ".gobby/rules";

#[derive(Clone)]
struct CachedEntry {
    definition: AnyDefinition,
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
}

impl CachedEntry {
    fn is_stale(&self) -> bool {
        let Some(path) = &self.path else {
            // Inline / agent-sourced entries never go stale.
            return false;
        };
        match std::fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => self.mtime != Some(modified),
            Err(_) => true, // file removed
        }
    }
}

#[derive(Clone)]
pub(crate) struct CachedDiscovery {
    results: Vec<DiscoveredWorkflow>,
    file_mtimes: HashMap<PathBuf, SystemTime>,
    dir_mtimes: HashMap<PathBuf, SystemTime>,
}

impl CachedDiscovery {
    fn is_stale(&self) -> bool {
        for (dir, recorded) in &self.dir_mtimes {
            match std::fs::metadata(dir).and_then(|meta| meta.modified()) {
                Ok(modified) if modified == *recorded => {}
                _ => return true,
            }
        }
        for (file, recorded) in &self.file_mtimes {
            match std::fs::metadata(file).and_then(|meta| meta.modified()) {
                Ok(modified) if modified == *recorded => {}
                _ => return true,
            }
        }
        false
    }
}

/// Loads, caches, and discovers workflow definitions.
pub struct WorkflowLoader {
    user_dirs: Vec<PathBuf>,
    bundled_dir: Option<PathBuf>,
    agent_source: Option<Arc<dyn AgentWorkflowSource>>,
    cache: RwLock<HashMap<String, CachedEntry>>,
    discovery_cache: RwLock<HashMap<String, CachedDiscovery>>,
}

impl WorkflowLoader {
    /// Loader rooted at the default user directory (`~/.gobby/workflows`),
    /// with no bundled fallback.
    pub fn new() -> Self {
        let user_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gobby")
            .join("workflows");
        Self::with_dirs(vec![user_dir], None)
    }

    /// Loader with explicit user directories and an optional bundled
    /// directory (lowest priority).
    pub fn with_dirs(user_dirs: Vec<PathBuf>, bundled_dir: Option<PathBuf>) -> Self {
        Self {
            user_dirs,
            bundled_dir,
            agent_source: None,
            cache: RwLock::new(HashMap::new()),
            discovery_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a resolver for qualified (`agent:workflow`) names.
    pub fn with_agent_source(mut self, source: Arc<dyn AgentWorkflowSource>) -> Self {
        self.agent_source = Some(source);
        self
    }

    pub(crate) fn user_dirs(&self) -> &[PathBuf] {
        &self.user_dirs
    }

    pub(crate) fn bundled_dir(&self) -> Option<&Path> {
        self.bundled_dir.as_deref()
    }

    /// Clear the definition and discovery caches. Safe to call while other
    /// tasks are loading; they will simply re-read from disk.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        self.discovery_cache.write().await.clear();
    }

    // ── Loading ─────────────────────────────────────────────────────────

    /// Load a workflow or pipeline by name (without extension).
    ///
    /// Returns `Ok(None)` when the name does not resolve or the file fails
    /// to parse (parse failures are logged). Configuration errors: cyclic
    /// `extends`, missing rule imports, invalid pipeline references: are
    /// returned as errors.
    pub async fn load_workflow(
        &self,
        name: &str,
        project_path: Option<&Path>,
    ) -> Result<Option<AnyDefinition>> {
        self.load_workflow_chain(name, project_path, &[]).await
    }

    /// Load a pipeline by name. Returns `Ok(None)` for non-pipeline files.
    pub async fn load_pipeline(
        &self,
        name: &str,
        project_path: Option<&Path>,
    ) -> Result<Option<Arc<PipelineDefinition>>> {
        let loaded = self.load_workflow(name, project_path).await?;
        Ok(loaded.and_then(|definition| definition.as_pipeline().cloned()))
    }

    fn load_workflow_chain<'a>(
        &'a self,
        name: &'a str,
        project_path: Option<&'a Path>,
        chain: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Option<AnyDefinition>>> + Send + 'a>> {
        Box::pin(async move {
            if chain.iter().any(|ancestor| ancestor == name) {
                let mut cycle: Vec<&str> = chain.iter().map(String::as_str).collect();
                cycle.push(name);
                let chain = cycle.join(" -> ");
                error!(%chain, "circular workflow inheritance detected");
                return Err(WorkflowError::CircularInheritance { chain });
            }

            let cache_key = cache_key(name, project_path);
            {
                let cache = self.cache.read().await;
                if let Some(entry) = cache.get(&cache_key) {
                    if !entry.is_stale() {
                        return Ok(Some(entry.definition.clone()));
                    }
                }
            }

            // Qualified names resolve through the agent definition source
            // before disk lookup.
            if name.contains(':') {
                if let Some(definition) = self.load_from_agent_source(name, project_path).await? {
                    self.cache.write().await.insert(
                        cache_key,
                        CachedEntry {
                            definition: definition.clone(),
                            path: None,
                            mtime: None,
                        },
                    );
                    return Ok(Some(definition));
                }
                // Fall through to disk (persisted inline workflows like
                // meeseeks-worker.yaml).
            }

            let Some(path) = self.find_workflow_file(name, project_path) else {
                warn!(name, "workflow not found in search directories");
                return Ok(None);
            };

            let content = std::fs::read_to_string(&path)?;
            let mut data: Map<String, Value> = match serde_yaml::from_str(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(name, path = %path.display(), "workflow file is not a mapping");
                    return Ok(None);
                }
                Err(e) => {
                    error!(name, path = %path.display(), error = %e, "failed to parse workflow");
                    return Ok(None);
                }
            };

            // Inheritance, with the current name pushed onto the chain.
            if let Some(parent_name) = data.get("extends").and_then(Value::as_str) {
                let parent_name = parent_name.to_string();
                let mut child_chain: Vec<String> = chain.to_vec();
                child_chain.push(name.to_string());
                match self
                    .load_workflow_chain(&parent_name, project_path, &child_chain)
                    .await?
                {
                    Some(parent) => {
                        let parent_data = definition_to_data(&parent)?;
                        data = merge_definitions(&parent_data, data);
                    }
                    None => {
                        error!(name, parent = %parent_name, "parent workflow not found");
                    }
                }
            }

            // Rule imports resolve before the definition is built.
            if data.get("imports").and_then(Value::as_array).is_some_and(|i| !i.is_empty()) {
                self.resolve_imports(&mut data, project_path)?;
            }

            let definition = match self.build_definition(name, data) {
                Ok(definition) => definition,
                Err(e @ (WorkflowError::CircularInheritance { .. }
                | WorkflowError::ImportNotFound(_)
                | WorkflowError::InvalidPipelineReference(_))) => return Err(e),
                Err(e) => {
                    error!(name, path = %path.display(), error = %e, "invalid workflow definition");
                    return Ok(None);
                }
            };

            let mtime = std::fs::metadata(&path).and_then(|meta| meta.modified()).ok();
            self.cache.write().await.insert(
                cache_key,
                CachedEntry {
                    definition: definition.clone(),
                    path: Some(path),
                    mtime,
                },
            );
            Ok(Some(definition))
        })
    }

    /// Build a typed definition from raw YAML data, routing `type: pipeline`
    /// to [`PipelineDefinition`].
    pub(crate) fn build_definition(
        &self,
        name: &str,
        mut data: Map<String, Value>,
    ) -> Result<AnyDefinition> {
        if data.get("name").map_or(true, Value::is_null) {
            data.insert("name".into(), Value::String(name.to_string()));
        }

        // Legacy `phases` key is the step list under another name.
        if !data.contains_key("steps") {
            if let Some(phases) = data.remove("phases") {
                data.insert("steps".into(), phases);
            }
        }

        if data.get("type").and_then(Value::as_str) == Some("pipeline") {
            validate::validate_pipeline_references(&data)?;
            data.remove("type");
            let pipeline: PipelineDefinition = serde_json::from_value(Value::Object(data))
                .map_err(|e| WorkflowError::invalid(name, e.to_string()))?;
            pipeline.validate()?;
            return Ok(AnyDefinition::Pipeline(Arc::new(pipeline)));
        }

        // Backward compat: derive `enabled` from the deprecated `type` field.
        if let Some(legacy_type) = data.get("type").and_then(Value::as_str) {
            if !data.contains_key("enabled") {
                let enabled = legacy_type == "lifecycle";
                data.insert("enabled".into(), Value::Bool(enabled));
            }
        }
        data.remove("type");

        let workflow: WorkflowDefinition = serde_json::from_value(Value::Object(data))
            .map_err(|e| WorkflowError::invalid(name, e.to_string()))?;
        workflow.validate()?;
        Ok(AnyDefinition::Workflow(Arc::new(workflow)))
    }

    async fn load_from_agent_source(
        &self,
        qualified_name: &str,
        project_path: Option<&Path>,
    ) -> Result<Option<AnyDefinition>> {
        let Some(source) = &self.agent_source else {
            return Ok(None);
        };
        let Some((agent, workflow)) = qualified_name.split_once(':') else {
            return Ok(None);
        };

        match source.inline_workflow(agent, workflow) {
            Some(WorkflowSpec::FileReference(file)) => {
                let file = file.strip_suffix(".yaml").unwrap_or(&file).to_string();
                debug!(qualified_name, file, "loading file-referenced agent workflow");
                self.load_workflow_chain(&file, project_path, &[]).await
            }
            Some(WorkflowSpec::Inline(data)) => {
                let definition = self.build_definition(qualified_name, data)?;
                Ok(Some(definition))
            }
            None => {
                debug!(qualified_name, "no inline workflow in agent definition");
                Ok(None)
            }
        }
    }

    /// Register an inline workflow definition directly into the cache.
    ///
    /// Inline workflows are embedded in agent definitions and registered at
    /// spawn time under qualified names; they are never written to disk.
    pub async fn register_inline_workflow(
        &self,
        name: &str,
        data: Map<String, Value>,
        project_path: Option<&Path>,
    ) -> Result<AnyDefinition> {
        let cache_key = cache_key(name, project_path);
        if let Some(entry) = self.cache.read().await.get(&cache_key) {
            return Ok(entry.definition.clone());
        }

        let definition = self.build_definition(name, data)?;
        self.cache.write().await.insert(
            cache_key,
            CachedEntry {
                definition: definition.clone(),
                path: None,
                mtime: None,
            },
        );
        debug!(name, "registered inline workflow");
        Ok(definition)
    }

    /// Check that a workflow can be explicitly activated for a session.
    ///
    /// Always-on workflows run automatically on events and are rejected; a
    /// name that does not resolve is left for the caller to decide.
    pub async fn validate_for_activation(
        &self,
        name: &str,
        project_path: Option<&Path>,
    ) -> std::result::Result<(), String> {
        let loaded = match self.load_workflow(name, project_path).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(format!("Failed to load workflow '{name}': {e}")),
        };
        match loaded {
            Some(AnyDefinition::Workflow(workflow)) if workflow.enabled => Err(format!(
                "Cannot activate always-on workflow '{name}'. Always-on workflows run \
                 automatically on events; use an on-demand workflow (enabled: false) instead."
            )),
            _ => Ok(()),
        }
    }

    // ── File resolution ─────────────────────────────────────────────────

    fn search_dirs(&self, project_path: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(project) = project_path {
            dirs.push(project.join(PROJECT_WORKFLOW_DIR));
        }
        dirs.extend(self.user_dirs.iter().cloned());
        if let Some(bundled) = &self.bundled_dir {
            if bundled.is_dir() {
                dirs.push(bundled.clone());
            }
        }
        dirs
    }

    fn find_workflow_file(&self, name: &str, project_path: Option<&Path>) -> Option<PathBuf> {
        // Qualified names also try their dash form ("meeseeks:worker" →
        // "meeseeks-worker.yaml") for persisted inline workflows.
        let mut filenames = vec![format!("{name}.yaml")];
        if name.contains(':') {
            filenames.push(format!("{}.yaml", name.replace(':', "-")));
        }

        for dir in self.search_dirs(project_path) {
            for filename in &filenames {
                let candidate = dir.join(filename);
                if candidate.exists() {
                    return Some(candidate);
                }
                // One level of subdirectories (lifecycle/, etc.)
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let subdir = entry.path();
                    if subdir.is_dir() {
                        let candidate = subdir.join(filename);
                        if candidate.exists() {
                            return Some(candidate);
                        }
                    }
                }
            }
        }
        None
    }

    fn find_rule_file(&self, name: &str, project_path: Option<&Path>) -> Option<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(project) = project_path {
            dirs.push(project.join(PROJECT_RULE_DIR));
        }
        for user_dir in &self.user_dirs {
            if let Some(parent) = user_dir.parent() {
                dirs.push(parent.join("rules"));
            }
        }
        if let Some(bundled) = &self.bundled_dir {
            if let Some(parent) = bundled.parent() {
                dirs.push(parent.join("rules"));
            }
        }

        let filename = format!("{name}.yaml");
        dirs.into_iter()
            .map(|dir| dir.join(&filename))
            .find(|candidate| candidate.exists())
    }

    /// Resolve the `imports` field by loading and merging rule definitions.
    ///
    /// Later imports override earlier ones; the importing file's own
    /// `rule_definitions` override everything imported.
    fn resolve_imports(
        &self,
        data: &mut Map<String, Value>,
        project_path: Option<&Path>,
    ) -> Result<()> {
        let imports: Vec<String> = data
            .get("imports")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut merged = Map::new();
        for import_name in &imports {
            let path = self
                .find_rule_file(import_name, project_path)
                .ok_or_else(|| WorkflowError::ImportNotFound(import_name.clone()))?;
            let content = std::fs::read_to_string(&path)?;
            let rules: Map<String, Value> = serde_yaml::from_str::<Value>(&content)
                .ok()
                .and_then(|value| {
                    value
                        .get("rule_definitions")
                        .and_then(Value::as_object)
                        .cloned()
                })
                .unwrap_or_default();
            for (rule_name, rule) in rules {
                merged.insert(rule_name, rule);
            }
        }

        if let Some(local) = data.get("rule_definitions").and_then(Value::as_object) {
            for (rule_name, rule) in local.clone() {
                merged.insert(rule_name, rule);
            }
        }

        data.insert("rule_definitions".into(), Value::Object(merged));
        Ok(())
    }

    // ── Discovery (delegates) ───────────────────────────────────────────

    /// Discover all workflows across the search roots, ordered project
    /// first, then `(priority asc, name asc)`.
    pub async fn discover_workflows(
        &self,
        project_path: Option<&Path>,
    ) -> Vec<DiscoveredWorkflow> {
        discovery::discover(self, project_path, discovery::Kind::Workflows).await
    }

    /// Discover pipeline workflows only.
    pub async fn discover_pipelines(&self, project_path: Option<&Path>) -> Vec<DiscoveredWorkflow> {
        discovery::discover(self, project_path, discovery::Kind::Pipelines).await
    }

    pub(crate) async fn cached_discovery(&self, key: &str) -> Option<Vec<DiscoveredWorkflow>> {
        let cache = self.discovery_cache.read().await;
        cache.get(key).filter(|entry| !entry.is_stale()).map(|entry| entry.results.clone())
    }

    pub(crate) async fn store_discovery(
        &self,
        key: String,
        results: Vec<DiscoveredWorkflow>,
        file_mtimes: HashMap<PathBuf, SystemTime>,
        dir_mtimes: HashMap<PathBuf, SystemTime>,
    ) {
        self.discovery_cache.write().await.insert(
            key,
            CachedDiscovery {
                results,
                file_mtimes,
                dir_mtimes,
            },
        );
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(name: &str, project_path: Option<&Path>) -> String {
    match project_path {
        Some(project) => format!("{}:{name}", project.display()),
        None => format!("global:{name}"),
    }
}

/// Serialize a loaded definition back to raw data for inheritance merging.
fn definition_to_data(definition: &AnyDefinition) -> Result<Map<String, Value>> {
    let value = match definition {
        AnyDefinition::Workflow(workflow) => serde_json::to_value(workflow.as_ref()),
        AnyDefinition::Pipeline(pipeline) => serde_json::to_value(pipeline.as_ref()),
    }
    .map_err(|e| WorkflowError::invalid(definition.name(), e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Deep-merge parent and child workflow data; child overrides parent.
///
/// Nested mappings merge recursively; step lists merge by key; everything
/// else is replaced wholesale by the child value.
pub(crate) fn merge_definitions(
    parent: &Map<String, Value>,
    child: Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = parent.clone();

    for (key, value) in child {
        let is_step_list = (key == "steps" || key == "phases")
            && (parent.contains_key("steps") || parent.contains_key("phases"));
        if is_step_list {
            let parent_steps = parent
                .get("phases")
                .or_else(|| parent.get("steps"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let child_steps = value.as_array().cloned().unwrap_or_default();
            let merged_key = if parent.contains_key("phases") { "phases" } else { "steps" };
            merged.insert(
                merged_key.to_string(),
                Value::Array(merge_steps(parent_steps, child_steps)),
            );
            continue;
        }

        match (merged.get(&key), &value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let combined = merge_definitions(existing, incoming.clone());
                merged.insert(key, Value::Object(combined));
            }
            _ => {
                merged.insert(key, value);
            }
        }
    }

    merged
}

/// Merge step lists by key (`id` for pipelines, `name` otherwise). Child
/// entries override matching parent entries field-wise and append otherwise.
fn merge_steps(parent_steps: Vec<Value>, child_steps: Vec<Value>) -> Vec<Value> {
    let key_field = parent_steps
        .first()
        .or(child_steps.first())
        .and_then(Value::as_object)
        .map(|step| if step.contains_key("id") { "id" } else { "name" })
        .unwrap_or("name");

    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Map<String, Value>> = HashMap::new();

    for step in parent_steps {
        let Some(map) = step.as_object() else { continue };
        let Some(key) = map.get(key_field).and_then(Value::as_str) else {
            warn!(key_field, "skipping parent step without key");
            continue;
        };
        order.push(key.to_string());
        by_key.insert(key.to_string(), map.clone());
    }

    for step in child_steps {
        let Some(map) = step.as_object() else { continue };
        let Some(key) = map.get(key_field).and_then(Value::as_str) else {
            warn!(key_field, "skipping child step without key");
            continue;
        };
        match by_key.get_mut(key) {
            Some(existing) => {
                for (field, field_value) in map.clone() {
                    existing.insert(field, field_value);
                }
            }
            None => {
                order.push(key.to_string());
                by_key.insert(key.to_string(), map.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key).map(Value::Object))
        .collect()
}

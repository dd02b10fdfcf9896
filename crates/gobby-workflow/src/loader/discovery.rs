//! Workflow discovery across the project / user / bundled roots.
//!
//! Discovery scans every root for YAML files, parses them, and returns an
//! ordered list: project entries first, then `(priority asc, name asc)`
//! within each bucket. Same-named entries shadow lower-priority roots.
//! Results are cached per `(kind, project_path)` with recorded file and
//! directory mtimes; any change invalidates the cache entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::definitions::AnyDefinition;
use crate::loader::{PROJECT_WORKFLOW_DIR, WorkflowLoader};

/// A discovered workflow with ordering metadata.
#[derive(Debug, Clone)]
pub struct DiscoveredWorkflow {
    pub name: String,
    pub definition: AnyDefinition,
    /// Lower runs first within a bucket.
    pub priority: i64,
    /// True when loaded from the project directory.
    pub is_project: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Workflows,
    Pipelines,
}

impl Kind {
    fn cache_prefix(&self) -> &'static str {
        match self {
            Kind::Workflows => "workflows",
            Kind::Pipelines => "pipelines",
        }
    }
}

struct Scan {
    discovered: HashMap<String, DiscoveredWorkflow>,
    failed: HashMap<String, String>,
    file_mtimes: HashMap<PathBuf, SystemTime>,
    dir_mtimes: HashMap<PathBuf, SystemTime>,
}

pub(crate) async fn discover(
    loader: &WorkflowLoader,
    project_path: Option<&Path>,
    kind: Kind,
) -> Vec<DiscoveredWorkflow> {
    let cache_key = match project_path {
        Some(project) => format!("{}:{}", kind.cache_prefix(), project.display()),
        None => format!("{}:global", kind.cache_prefix()),
    };

    if let Some(cached) = loader.cached_discovery(&cache_key).await {
        return cached;
    }

    let mut scan = Scan {
        discovered: HashMap::new(),
        failed: HashMap::new(),
        file_mtimes: HashMap::new(),
        dir_mtimes: HashMap::new(),
    };

    // Bundled first (lowest priority, shadowed by all), then user, then
    // project: later scans overwrite same-named entries.
    if let Some(bundled) = loader.bundled_dir() {
        scan_directory(loader, bundled, false, kind, &mut scan).await;
    }
    for user_dir in loader.user_dirs() {
        scan_directory(loader, user_dir, false, kind, &mut scan).await;
    }
    if let Some(project) = project_path {
        let project_dir = project.join(PROJECT_WORKFLOW_DIR);
        scan_directory(loader, &project_dir, true, kind, &mut scan).await;

        // A broken project workflow silently falling back to the global copy
        // is confusing; call it out.
        for (name, error) in &scan.failed {
            if let Some(existing) = scan.discovered.get(name) {
                if !existing.is_project {
                    error!(
                        workflow = %name,
                        fallback = %existing.path.display(),
                        %error,
                        "project workflow failed to load, using global instead"
                    );
                }
            }
        }
    }

    let mut results: Vec<DiscoveredWorkflow> = scan.discovered.into_values().collect();
    results.sort_by(|a, b| {
        let bucket_a = if a.is_project { 0 } else { 1 };
        let bucket_b = if b.is_project { 0 } else { 1 };
        bucket_a
            .cmp(&bucket_b)
            .then(a.priority.cmp(&b.priority))
            .then(a.name.cmp(&b.name))
    });

    loader
        .store_discovery(cache_key, results.clone(), scan.file_mtimes, scan.dir_mtimes)
        .await;
    results
}

async fn scan_directory(
    loader: &WorkflowLoader,
    directory: &Path,
    is_project: bool,
    kind: Kind,
    scan: &mut Scan,
) {
    if !directory.exists() {
        return;
    }

    if let Ok(modified) = std::fs::metadata(directory).and_then(|meta| meta.modified()) {
        scan.dir_mtimes.insert(directory.to_path_buf(), modified);
    }

    let Ok(entries) = std::fs::read_dir(directory) else {
        warn!(directory = %directory.display(), "failed to read workflow directory");
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "yaml") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        if let Ok(modified) = std::fs::metadata(&path).and_then(|meta| meta.modified()) {
            scan.file_mtimes.insert(path.clone(), modified);
        }

        match load_file(loader, &path, name, kind).await {
            Ok(Some(discovered)) => {
                if scan.discovered.contains_key(name) && is_project {
                    info!(workflow = name, "project workflow shadows global workflow");
                }
                scan.discovered.insert(
                    name.to_string(),
                    DiscoveredWorkflow {
                        name: name.to_string(),
                        is_project,
                        path: path.clone(),
                        ..discovered
                    },
                );
            }
            Ok(None) => {}
            Err(message) => {
                warn!(workflow = name, path = %path.display(), error = %message, "failed to load workflow");
                scan.failed.insert(name.to_string(), message);
            }
        }
    }
}

async fn load_file(
    loader: &WorkflowLoader,
    path: &Path,
    name: &str,
    kind: Kind,
) -> Result<Option<DiscoveredWorkflow>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let data: Map<String, Value> = match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => return Ok(None),
        Ok(_) => return Err("workflow file is not a mapping".to_string()),
        Err(e) => return Err(e.to_string()),
    };

    let is_pipeline = data.get("type").and_then(Value::as_str) == Some("pipeline");
    match kind {
        Kind::Pipelines if !is_pipeline => return Ok(None),
        Kind::Workflows if is_pipeline => {
            // Pipelines still appear in the unified listing; lifecycle
            // evaluation skips them by type.
        }
        _ => {}
    }

    // Inheritance during discovery goes through the loader so cycles are
    // detected against the shared chain.
    let data = if data.get("extends").and_then(Value::as_str).is_some() {
        debug!(workflow = name, "resolving inheritance during discovery");
        match resolve_extends(loader, name, data).await {
            Ok(data) => data,
            Err(message) => return Err(message),
        }
    } else {
        data
    };

    // Priority: top-level field, with a settings.priority fallback for
    // YAMLs not yet migrated.
    let mut priority = data.get("priority").and_then(Value::as_i64).unwrap_or(100);
    if priority == 100 {
        if let Some(settings_priority) = data
            .get("settings")
            .and_then(Value::as_object)
            .and_then(|settings| settings.get("priority"))
            .and_then(Value::as_i64)
        {
            priority = settings_priority;
        }
    }

    let definition = loader
        .build_definition(name, data)
        .map_err(|e| e.to_string())?;

    Ok(Some(DiscoveredWorkflow {
        name: name.to_string(),
        definition,
        priority,
        is_project: false,
        path: path.to_path_buf(),
    }))
}

async fn resolve_extends(
    loader: &WorkflowLoader,
    name: &str,
    mut data: Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let Some(parent_name) = data.get("extends").and_then(Value::as_str).map(str::to_string) else {
        return Ok(data);
    };
    match loader.load_workflow(&parent_name, None).await {
        Ok(Some(parent)) => {
            let parent_value = match &parent {
                AnyDefinition::Workflow(workflow) => serde_json::to_value(workflow.as_ref()),
                AnyDefinition::Pipeline(pipeline) => serde_json::to_value(pipeline.as_ref()),
            }
            .map_err(|e| e.to_string())?;
            if let Value::Object(parent_data) = parent_value {
                data = super::merge_definitions(&parent_data, data);
            }
            Ok(data)
        }
        Ok(None) => {
            warn!(workflow = name, parent = %parent_name, "parent workflow not found during discovery");
            Ok(data)
        }
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::WorkflowLoader;

    fn write(dir: &Path, filename: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(filename), content).unwrap();
    }

    #[tokio::test]
    async fn test_discovery_ordering() {
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let project_dir = project.path().join(PROJECT_WORKFLOW_DIR);

        write(user.path(), "zeta.yaml", "name: zeta\npriority: 1\n");
        write(user.path(), "alpha.yaml", "name: alpha\npriority: 1\n");
        write(user.path(), "late.yaml", "name: late\npriority: 50\n");
        write(&project_dir, "proj.yaml", "name: proj\npriority: 99\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        let discovered = loader.discover_workflows(Some(project.path())).await;
        let names: Vec<&str> = discovered.iter().map(|w| w.name.as_str()).collect();

        // Project first despite its high priority, then global by
        // (priority, name).
        assert_eq!(names, vec!["proj", "alpha", "zeta", "late"]);
        assert!(discovered[0].is_project);
    }

    #[tokio::test]
    async fn test_project_shadows_global_by_name() {
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let project_dir = project.path().join(PROJECT_WORKFLOW_DIR);

        write(user.path(), "wf.yaml", "name: wf\npriority: 10\n");
        write(&project_dir, "wf.yaml", "name: wf\npriority: 20\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        let discovered = loader.discover_workflows(Some(project.path())).await;
        assert_eq!(discovered.len(), 1);
        assert!(discovered[0].is_project);
        assert_eq!(discovered[0].priority, 20);
    }

    #[tokio::test]
    async fn test_broken_file_does_not_break_discovery() {
        let user = tempfile::tempdir().unwrap();
        write(user.path(), "good.yaml", "name: good\n");
        write(user.path(), "bad.yaml", "steps: [not: [valid: yaml\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        let discovered = loader.discover_workflows(None).await;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "good");
    }

    #[tokio::test]
    async fn test_settings_priority_fallback() {
        let user = tempfile::tempdir().unwrap();
        write(user.path(), "wf.yaml", "name: wf\nsettings:\n  priority: 7\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        let discovered = loader.discover_workflows(None).await;
        assert_eq!(discovered[0].priority, 7);
    }

    #[tokio::test]
    async fn test_pipeline_discovery_filters() {
        let user = tempfile::tempdir().unwrap();
        write(user.path(), "wf.yaml", "name: wf\n");
        write(
            user.path(),
            "pipe.yaml",
            "name: pipe\ntype: pipeline\nsteps:\n  - id: a\n    exec: x\n",
        );

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        let pipelines = loader.discover_pipelines(None).await;
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].name, "pipe");

        // Unified discovery sees both.
        let all = loader.discover_workflows(None).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_cache_and_invalidation() {
        let user = tempfile::tempdir().unwrap();
        write(user.path(), "wf.yaml", "name: wf\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        assert_eq!(loader.discover_workflows(None).await.len(), 1);

        // New file invalidates the cached directory listing.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(user.path(), "wf2.yaml", "name: wf2\n");
        assert_eq!(loader.discover_workflows(None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_yaml_files_skipped() {
        let user = tempfile::tempdir().unwrap();
        write(user.path(), "wf.yaml", "name: wf\n");
        write(user.path(), "notes.md", "# not a workflow\n");

        let loader = WorkflowLoader::with_dirs(vec![user.path().to_path_buf()], None);
        assert_eq!(loader.discover_workflows(None).await.len(), 1);
    }
}

//! Pipeline `$step.output` reference validation.
//!
//! Steps can only read the outputs of strictly earlier steps; pipeline
//! `outputs` may reference any step. `$inputs.*` is a pipeline-input
//! reference, not a step reference.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, WorkflowError};

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$([a-zA-Z_][a-zA-Z0-9_]*)\.(output|approved|status)").unwrap()
    })
}

/// Extract step IDs from `$step_id.(output|approved|status)` patterns.
pub fn extract_step_refs(text: &str) -> HashSet<String> {
    ref_pattern()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .filter(|name| name != "inputs")
        .collect()
}

/// Validate that every step reference in a pipeline's raw YAML data points
/// to a strictly earlier step, and that output references exist.
pub fn validate_pipeline_references(data: &Map<String, Value>) -> Result<()> {
    let steps: Vec<&Map<String, Value>> = data
        .get("steps")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();

    let step_ids: Vec<&str> = steps
        .iter()
        .filter_map(|step| step.get("id").and_then(Value::as_str))
        .collect();

    for (position, step) in steps.iter().enumerate() {
        let step_id = step
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{position}"));
        let valid: HashSet<&str> = step_ids[..position.min(step_ids.len())]
            .iter()
            .copied()
            .collect();

        for field in ["prompt", "condition", "input", "exec"] {
            let Some(text) = step.get(field).and_then(Value::as_str) else {
                continue;
            };
            for referenced in extract_step_refs(text) {
                if valid.contains(referenced.as_str()) {
                    continue;
                }
                if step_ids.contains(&referenced.as_str()) {
                    return Err(WorkflowError::InvalidPipelineReference(format!(
                        "step '{step_id}' {field} references step '{referenced}' which appears \
                         later in the pipeline; steps can only reference earlier steps"
                    )));
                }
                return Err(WorkflowError::InvalidPipelineReference(format!(
                    "step '{step_id}' {field} references unknown step '{referenced}'"
                )));
            }
        }
    }

    // Outputs may reference any step, but the step must exist.
    let all_ids: HashSet<&str> = step_ids.iter().copied().collect();
    if let Some(outputs) = data.get("outputs").and_then(Value::as_object) {
        for (output_name, output_value) in outputs {
            let Some(text) = output_value.as_str() else {
                continue;
            };
            for referenced in extract_step_refs(text) {
                if !all_ids.contains(referenced.as_str()) {
                    return Err(WorkflowError::InvalidPipelineReference(format!(
                        "pipeline output '{output_name}' references unknown step '{referenced}'"
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_extract_refs() {
        let refs = extract_step_refs("run $analyze.output then check $gate.approved");
        assert!(refs.contains("analyze"));
        assert!(refs.contains("gate"));
        assert_eq!(refs.len(), 2);

        // $inputs is a pipeline input, not a step
        assert!(extract_step_refs("$inputs.output").is_empty());
        // Bare $name without a typed suffix is not a reference
        assert!(extract_step_refs("$name.something_else").is_empty());
    }

    #[test]
    fn test_backward_reference_ok() {
        validate_pipeline_references(&data(json!({
            "steps": [
                {"id": "fetch", "exec": "curl x"},
                {"id": "summarize", "prompt": "Summarize: $fetch.output"}
            ]
        })))
        .unwrap();
    }

    #[test]
    fn test_forward_reference_rejected() {
        let err = validate_pipeline_references(&data(json!({
            "steps": [
                {"id": "summarize", "prompt": "Summarize: $fetch.output"},
                {"id": "fetch", "exec": "curl x"}
            ]
        })))
        .unwrap_err();
        assert!(err.to_string().contains("later in the pipeline"));
    }

    #[test]
    fn test_self_reference_rejected() {
        let err = validate_pipeline_references(&data(json!({
            "steps": [{"id": "a", "exec": "echo $a.output"}]
        })))
        .unwrap_err();
        assert!(err.to_string().contains("later in the pipeline"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = validate_pipeline_references(&data(json!({
            "steps": [{"id": "a", "prompt": "$ghost.output"}]
        })))
        .unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_outputs_may_reference_any_step() {
        validate_pipeline_references(&data(json!({
            "steps": [
                {"id": "a", "exec": "x"},
                {"id": "b", "exec": "y"}
            ],
            "outputs": {"final": "$b.output", "first": "$a.output"}
        })))
        .unwrap();

        let err = validate_pipeline_references(&data(json!({
            "steps": [{"id": "a", "exec": "x"}],
            "outputs": {"final": "$ghost.output"}
        })))
        .unwrap_err();
        assert!(err.to_string().contains("output 'final'"));
    }
}

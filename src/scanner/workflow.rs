//! Structural detection of embedded generation workflows.
//!
//! Node-graph payloads come in two shapes: an editor export with a
//! `nodes` array, and an API prompt mapping node id → `{class_type, inputs}`.
//! Text-only generators embed a `parameters` block instead.

use serde_json::Value;

const SAMPLING_PARAMS: &[&str] = &["steps", "cfg", "seed", "noise_seed", "sampler_name", "denoise", "scheduler"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowFlags {
    pub has_workflow: bool,
    pub has_generation_data: bool,
}

impl WorkflowFlags {
    fn merge(&mut self, other: WorkflowFlags) {
        self.has_workflow |= other.has_workflow;
        self.has_generation_data |= other.has_generation_data;
    }
}

/// Inspect a tag map for embedded workflow or generation data.
pub fn inspect(tags: &serde_json::Map<String, Value>) -> WorkflowFlags {
    let mut flags = WorkflowFlags::default();
    for (key, value) in tags {
        match key.to_ascii_lowercase().as_str() {
            "workflow" | "prompt" | "comment" | "usercomment" => {
                if let Some(graph) = as_json(value) {
                    flags.merge(inspect_graph(&graph));
                }
            }
            "parameters" => {
                if let Some(text) = value.as_str() {
                    flags.has_generation_data |= is_parameters_text(text);
                }
            }
            _ => {}
        }
    }
    flags
}

/// JSON embedded either directly or as a string.
fn as_json(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.starts_with('{') {
                return None;
            }
            serde_json::from_str(trimmed).ok()
        }
        _ => None,
    }
}

fn inspect_graph(graph: &Value) -> WorkflowFlags {
    let Some(obj) = graph.as_object() else {
        return WorkflowFlags::default();
    };

    // Comment fields sometimes wrap the graph one level down.
    for key in ["workflow", "prompt"] {
        if let Some(inner) = obj.get(key).and_then(as_json) {
            return inspect_graph(&inner);
        }
    }

    let nodes: Vec<&Value> = match obj.get("nodes") {
        Some(Value::Array(nodes)) => nodes.iter().collect(),
        _ => obj
            .values()
            .filter(|v| v.get("class_type").is_some())
            .collect(),
    };

    WorkflowFlags {
        has_workflow: !nodes.is_empty(),
        has_generation_data: nodes.iter().any(|n| is_sampler_node(n)),
    }
}

fn is_sampler_node(node: &Value) -> bool {
    let class = node
        .get("class_type")
        .or_else(|| node.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !class.to_ascii_lowercase().contains("sampler") {
        return false;
    }

    let has_named_params = node
        .get("inputs")
        .and_then(Value::as_object)
        .map(|inputs| SAMPLING_PARAMS.iter().any(|p| inputs.contains_key(*p)))
        .unwrap_or(false);
    let has_widget_values = node
        .get("widgets_values")
        .and_then(Value::as_array)
        .map(|w| !w.is_empty())
        .unwrap_or(false);

    has_named_params || has_widget_values
}

/// A1111-style `parameters` text: prompt lines followed by
/// `Steps: N, Sampler: X, CFG scale: Y, ...`.
fn is_parameters_text(text: &str) -> bool {
    text.contains("Steps:") && (text.contains("Sampler:") || text.contains("CFG scale:"))
}

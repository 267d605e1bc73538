pub mod tracker;

pub use tracker::{StageUpdate, ToolStage, ToolTracker, TrackedTool};

use serde_json::Value;

/// Canonicalizes a JSON value for duplicate-call detection (`spec.md` §4.1:
/// "JSON-serialize args with sorted keys"). Object keys are sorted
/// recursively so the result is independent of argument insertion order at
/// any nesting depth, rather than relying on `serde_json`'s default map
/// representation.
pub fn canonicalize_args(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let sorted = entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort(v)))
                    .collect();
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }

    sort(value).to_string()
}

/// The duplicate-suppression / tracker key: `tool_name + canonical(args)`.
pub fn call_key(tool_name: &str, args: &Value) -> String {
    format!("{tool_name}:{}", canonicalize_args(args))
}

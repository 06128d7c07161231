use serde_json::Value;
use tracing::warn;

use agentmesh_core::path;
use agentmesh_core::types::{Inputs, TaskStatus};

use super::run::TaskMap;

/// Resolve every `{{step_id.path}}` placeholder in a step's inputs.
///
/// Only strings that are exactly one reference are substituted, keeping the
/// referenced value's type. Arrays and objects are walked recursively.
/// References to unknown or unfinished steps, or to missing paths, become
/// `null` with a warning.
pub fn resolve_inputs(inputs: &Inputs, tasks: &TaskMap) -> Inputs {
    inputs
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, tasks)))
        .collect()
}

/// Resolve a single JSON value.
pub fn resolve_value(value: &Value, tasks: &TaskMap) -> Value {
    match value {
        Value::String(s) => match parse_placeholder(s) {
            Some(reference) => resolve_reference(reference, tasks),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, tasks)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, tasks)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Return the inner reference if `s` is exactly `{{ ... }}`.
pub fn parse_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.is_empty() || inner.contains(['{', '}']) {
        return None;
    }
    Some(inner)
}

fn resolve_reference(reference: &str, tasks: &TaskMap) -> Value {
    let mut segments = path::segments(reference).peekable();
    let Some(step_id) = segments.next() else {
        return Value::Null;
    };

    let result = match tasks.get(step_id) {
        Some(task) if task.status == TaskStatus::Completed => task.result.as_ref(),
        Some(task) => {
            warn!(step_id, status = %task.status, reference, "Placeholder references unfinished step");
            return Value::Null;
        }
        None => {
            warn!(step_id, reference, "Placeholder references unknown step");
            return Value::Null;
        }
    };
    let Some(result) = result else {
        return Value::Null;
    };

    // `{{step.result.x}}` and `{{step.x}}` address the same value
    if segments.peek() == Some(&"result") {
        segments.next();
    }

    match path::lookup(result, segments) {
        Some(found) => found.clone(),
        None => {
            warn!(step_id, reference, "Placeholder path not found in step result");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::types::TaskState;
    use serde_json::json;

    fn completed(result: Value) -> TaskState {
        let mut task = TaskState::pending();
        task.start();
        task.complete(result);
        task
    }

    fn tasks() -> TaskMap {
        let mut tasks = TaskMap::new();
        tasks.insert("stepX".into(), completed(json!({"a": {"b": 5}, "items": [1, 2], "none": null})));
        tasks.insert("waiting".into(), TaskState::pending());
        tasks
    }

    #[test]
    fn result_prefix_is_optional() {
        let tasks = tasks();
        assert_eq!(resolve_value(&json!("{{stepX.result.a.b}}"), &tasks), json!(5));
        assert_eq!(resolve_value(&json!("{{stepX.a.b}}"), &tasks), json!(5));
    }

    #[test]
    fn whole_result_and_type_preservation() {
        let tasks = tasks();
        assert_eq!(resolve_value(&json!("{{stepX.a}}"), &tasks), json!({"b": 5}));
        assert_eq!(resolve_value(&json!("{{stepX.result}}"), &tasks)["items"], json!([1, 2]));
        assert_eq!(resolve_value(&json!("{{ stepX.items.1 }}"), &tasks), json!(2));
        assert_eq!(resolve_value(&json!("{{stepX.none}}"), &tasks), Value::Null);
    }

    #[test]
    fn missing_references_become_null() {
        let tasks = tasks();
        assert_eq!(resolve_value(&json!("{{nope.a}}"), &tasks), Value::Null);
        assert_eq!(resolve_value(&json!("{{stepX.a.zz}}"), &tasks), Value::Null);
        assert_eq!(resolve_value(&json!("{{waiting.a}}"), &tasks), Value::Null);
    }

    #[test]
    fn non_reference_strings_pass_through() {
        let tasks = tasks();
        for s in ["plain", "prefix {{stepX.a.b}}", "{{stepX.a.b}} suffix", "{{}}", "{stepX.a}"] {
            assert_eq!(resolve_value(&json!(s), &tasks), json!(s));
        }
        assert_eq!(resolve_value(&json!(42), &tasks), json!(42));
    }

    #[test]
    fn nested_inputs_are_resolved() {
        let tasks = tasks();
        let inputs = json!({
            "direct": "{{stepX.a.b}}",
            "list": ["{{stepX.items.0}}", "literal"],
            "obj": {"inner": "{{stepX.a}}"}
        });
        let resolved = resolve_inputs(inputs.as_object().unwrap(), &tasks);
        assert_eq!(
            Value::Object(resolved),
            json!({
                "direct": 5,
                "list": [1, "literal"],
                "obj": {"inner": {"b": 5}}
            })
        );
    }

    #[test]
    fn parse_placeholder_exact_only() {
        assert_eq!(parse_placeholder("{{a.b}}"), Some("a.b"));
        assert_eq!(parse_placeholder("{{ a }}"), Some("a"));
        assert_eq!(parse_placeholder("x{{a}}"), None);
        assert_eq!(parse_placeholder("{{a}} {{b}}"), None);
    }

    #[test]
    fn stray_braces_are_not_references() {
        assert_eq!(parse_placeholder("{{a}}}"), None);
        assert_eq!(parse_placeholder("{{{a}}"), None);
        assert_eq!(
            resolve_value(&json!("{{a}}}"), &tasks()),
            json!("{{a}}}")
        );
    }
}

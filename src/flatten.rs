//! Dotted-path flattening of structured domain records.
//!
//! Any JSON tree is accepted. Each non-empty scalar leaf becomes one
//! [`FlatField`] addressed by its path (`architecture.data_flow`,
//! `key_files[0].purpose`). Leaves inside an array of objects are prefixed
//! with their element's label (its `name`, `title`, `file`, `path`, `id` or
//! `key` field) so that a match on a sibling field still shows which
//! element it belongs to.

use serde_json::{Map, Value};

/// Sub-fields that identify an element of an array of objects, in priority order.
const LABEL_KEYS: [&str; 6] = ["name", "title", "file", "path", "id", "key"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatField {
    pub path: String,
    pub text: String,
}

pub fn flatten(value: &Value) -> Vec<FlatField> {
    let mut out = Vec::new();
    match value {
        Value::Object(map) => visit_object(map, "", None, &mut out),
        Value::Array(items) => visit_array(items, "", &mut out),
        scalar => push_scalar(scalar, "$", None, &mut out),
    }
    out
}

fn visit(value: &Value, path: &str, label: Option<&str>, out: &mut Vec<FlatField>) {
    match value {
        Value::Object(map) => visit_object(map, path, label, out),
        Value::Array(items) => visit_array(items, path, out),
        scalar => push_scalar(scalar, path, label, out),
    }
}

fn visit_object(
    map: &Map<String, Value>,
    prefix: &str,
    label: Option<&str>,
    out: &mut Vec<FlatField>,
) {
    // key order must not depend on serde_json's preserve_order feature
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (key, value) in entries {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        visit(value, &path, label, out);
    }
}

fn visit_array(items: &[Value], prefix: &str, out: &mut Vec<FlatField>) {
    for (i, item) in items.iter().enumerate() {
        let path = format!("{}[{}]", prefix, i);
        match item {
            Value::Object(map) => {
                let label = element_label(map);
                visit_object(map, &path, label.as_deref(), out);
            }
            other => visit(other, &path, None, out),
        }
    }
}

fn element_label(map: &Map<String, Value>) -> Option<String> {
    LABEL_KEYS
        .iter()
        .filter_map(|k| map.get(*k))
        .find_map(scalar_text)
}

fn push_scalar(value: &Value, path: &str, label: Option<&str>, out: &mut Vec<FlatField>) {
    let Some(text) = scalar_text(value) else {
        return;
    };
    let text = match label {
        Some(label) if label != text => format!("{}: {}", label, text),
        _ => text,
    };
    out.push(FlatField {
        path: path.to_string(),
        text,
    });
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(fields: &[FlatField]) -> Vec<&str> {
        fields.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn nested_objects_use_dotted_paths() {
        let fields = flatten(&json!({
            "architecture": { "data_flow": "request -> handler -> store" },
            "summary": "auth domain"
        }));
        assert_eq!(paths(&fields), ["architecture.data_flow", "summary"]);
        assert_eq!(fields[0].text, "request -> handler -> store");
    }

    #[test]
    fn arrays_of_objects_carry_element_label() {
        let fields = flatten(&json!({
            "key_files": [
                { "path": "src/auth.rs", "purpose": "session handling" },
                { "path": "src/db.rs", "purpose": "pool setup" }
            ]
        }));
        assert_eq!(
            paths(&fields),
            [
                "key_files[0].path",
                "key_files[0].purpose",
                "key_files[1].path",
                "key_files[1].purpose"
            ]
        );
        assert_eq!(fields[0].text, "src/auth.rs");
        assert_eq!(fields[1].text, "src/auth.rs: session handling");
    }

    #[test]
    fn scalar_arrays_and_mixed_types() {
        let fields = flatten(&json!({
            "gotchas": ["tokens expire after 15m", "", null],
            "dependencies": [{ "name": "redis", "version": 7 }],
            "stable": true
        }));
        let got: Vec<(&str, &str)> = fields
            .iter()
            .map(|f| (f.path.as_str(), f.text.as_str()))
            .collect();
        assert_eq!(
            got,
            [
                ("dependencies[0].name", "redis"),
                ("dependencies[0].version", "redis: 7"),
                ("gotchas[0]", "tokens expire after 15m"),
                ("stable", "true"),
            ]
        );
    }

    #[test]
    fn arrays_nested_in_arrays() {
        let fields = flatten(&json!({ "matrix": [[1, 2], [3]] }));
        assert_eq!(paths(&fields), ["matrix[0][0]", "matrix[0][1]", "matrix[1][0]"]);
    }

    #[test]
    fn non_object_roots() {
        assert_eq!(paths(&flatten(&json!(["a", "b"]))), ["[0]", "[1]"]);
        assert_eq!(paths(&flatten(&json!("just text"))), ["$"]);
        assert!(flatten(&json!(null)).is_empty());
    }

    #[test]
    fn deep_nesting_is_handled() {
        let mut value = json!("bottom");
        for _ in 0..60 {
            value = json!({ "n": value });
        }
        let fields = flatten(&value);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].path.matches('.').count(), 59);
    }

    #[test]
    fn output_is_deterministic() {
        let value = json!({ "b": { "y": 1, "x": 2 }, "a": [ { "id": "k", "v": "w" } ] });
        assert_eq!(flatten(&value), flatten(&value));
    }
}

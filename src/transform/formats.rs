//! Built-in formatters

use super::{create_formatter, UnitFactory};
use crate::error::TransformError;
use crate::payload::Payload;
use serde::Serialize;
use serde_json::{Map, Value};

/// Render the payload as one JSON document.
///
/// Options: `props` (keep only these keys), `exclude` (drop these keys),
/// `stable` (sort keys recursively), `space` (indent width, 0 renders a
/// single line).
pub fn json() -> UnitFactory {
    create_formatter("json", |payload: &Payload, options: &Value| {
        let mut value = reduce(payload.to_value(), options);
        if options.get("stable").and_then(Value::as_bool).unwrap_or(false) {
            value = sort_keys(value);
        }
        let space = options.get("space").and_then(Value::as_u64).unwrap_or(0) as usize;
        render(&value, space).map_err(|e| TransformError::failed(e.to_string()))
    })
}

fn reduce(value: Value, options: &Value) -> Value {
    let Value::Object(obj) = value else {
        return value;
    };
    let keep: Option<Vec<&str>> = options
        .get("props")
        .and_then(Value::as_array)
        .map(|p| p.iter().filter_map(Value::as_str).collect());
    let exclude: Vec<&str> = options
        .get("exclude")
        .and_then(Value::as_array)
        .map(|p| p.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let reduced: Map<String, Value> = match keep {
        Some(keep) => keep
            .iter()
            .filter_map(|k| obj.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect(),
        None => obj,
    };
    Value::Object(
        reduced
            .into_iter()
            .filter(|(k, _)| !exclude.contains(&k.as_str()))
            .collect(),
    )
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(String, Value)> = obj.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn render(value: &Value, space: usize) -> Result<String, serde_json::Error> {
    if space == 0 {
        return serde_json::to_string(value);
    }
    let indent = " ".repeat(space);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{default_levels, DispatchConfig, Source};
    use crate::transform::{combine, modifiers};
    use serde_json::json;

    fn payload() -> Payload {
        let mut record = Source::new("info", "hello");
        record.fields.insert("zeta".into(), json!(1));
        record.fields.insert("alpha".into(), json!({"b": 2, "a": 1}));
        Payload::new(record, DispatchConfig::new("app", default_levels().into()))
    }

    fn render_with(options: Value) -> String {
        let result = combine([json().with(options)]).apply(payload());
        assert!(result.is_ok());
        result.payload.output().unwrap_or_default().to_string()
    }

    #[test]
    fn test_json_keeps_insertion_order() {
        assert_eq!(
            render_with(json!({})),
            r#"{"level":"info","message":"hello","zeta":1,"alpha":{"b":2,"a":1}}"#
        );
    }

    #[test]
    fn test_json_stable_sorts_keys() {
        assert_eq!(
            render_with(json!({"stable": true})),
            r#"{"alpha":{"a":1,"b":2},"level":"info","message":"hello","zeta":1}"#
        );
    }

    #[test]
    fn test_json_props_and_exclude() {
        assert_eq!(
            render_with(json!({"props": ["message", "zeta", "missing"]})),
            r#"{"message":"hello","zeta":1}"#
        );
        assert_eq!(
            render_with(json!({"exclude": ["alpha", "level"]})),
            r#"{"message":"hello","zeta":1}"#
        );
    }

    #[test]
    fn test_json_space() {
        let out = render_with(json!({"props": ["zeta"], "space": 2}));
        assert_eq!(out, "{\n  \"zeta\": 1\n}");
    }

    #[test]
    fn test_json_sees_modified_payload() {
        let stack = combine([json().unit(), modifiers::extend().with(json!({"pid": 7}))]);
        let out = stack.apply(payload()).payload;
        let parsed: Value = serde_json::from_str(out.output().unwrap_or_default()).unwrap();
        assert_eq!(parsed["pid"], json!(7));
    }
}

//! Bundled stacks assembled from the built-in units

use super::{combine, formats, modifiers, TransformStack, TransformUnit};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Options for [`file`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStackOptions {
    /// Keep unleveled `log()` payloads.
    #[serde(default)]
    pub include_log: bool,

    /// Timestamp format, `None` disables stamping.
    #[serde(default = "default_timestamp")]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub label: bool,

    #[serde(default = "default_true")]
    pub private: bool,

    /// Nest metadata under this property.
    #[serde(default)]
    pub meta: Option<String>,

    #[serde(default = "default_true")]
    pub splat: bool,

    #[serde(default = "default_errorify")]
    pub errorify: String,

    #[serde(default)]
    pub extend: Option<Map<String, Value>>,

    #[serde(default)]
    pub props: Option<Vec<String>>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_timestamp() -> Option<String> {
    Some("rfc3339".to_string())
}

fn default_true() -> bool {
    true
}

fn default_errorify() -> String {
    "stack".to_string()
}

impl Default for FileStackOptions {
    fn default() -> Self {
        Self {
            include_log: false,
            timestamp: default_timestamp(),
            label: false,
            private: true,
            meta: None,
            splat: true,
            errorify: default_errorify(),
            extend: None,
            props: None,
            exclude: Vec::new(),
        }
    }
}

/// One JSON document per line, stamped so the query engine can window it.
pub fn file(options: &FileStackOptions) -> TransformStack {
    let mut units: Vec<TransformUnit> = Vec::new();

    if !options.include_log {
        units.push(modifiers::leveled_only().unit());
    }
    if options.private {
        units.push(modifiers::private().unit());
    }
    if let Some(extra) = &options.extend {
        units.push(modifiers::extend().with(Value::Object(extra.clone())));
    }
    if options.splat {
        units.push(modifiers::splat().unit());
    }
    if let Some(format) = &options.timestamp {
        units.push(modifiers::timestamp().with(json!({ "format": format })));
    }
    if options.label {
        units.push(modifiers::label().with(json!({ "template": "{label}" })));
    }
    if let Some(prop) = &options.meta {
        units.push(modifiers::meta().with(json!({
            "prop": prop,
            "exclude": ["timestamp", "label"],
        })));
    }
    units.push(modifiers::errorify().with(json!({ "format": options.errorify })));

    let mut json_opts = json!({ "exclude": options.exclude });
    if let Some(props) = &options.props {
        json_opts["props"] = json!(props);
    }
    units.push(formats::json().with(json_opts));

    combine(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{default_levels, DispatchConfig, Payload, Source};

    fn payload(level: &str, message: &str) -> Payload {
        let mut record = Source::new(level, message);
        record.splat = vec![json!("world")];
        record.fields.insert("user".into(), json!("milton"));
        Payload::new(record, DispatchConfig::new("app", default_levels().into()))
    }

    #[test]
    fn test_file_stack_renders_json_line() {
        let result = file(&FileStackOptions::default()).apply(payload("info", "hello %s"));
        assert!(result.is_ok());
        let row: Value = serde_json::from_str(result.payload.output().unwrap_or_default()).unwrap();
        assert_eq!(row["level"], json!("info"));
        assert_eq!(row["message"], json!("hello world"));
        assert_eq!(row["user"], json!("milton"));
        assert!(crate::query::parse_timestamp(&row["timestamp"]).is_some());
    }

    #[test]
    fn test_file_stack_skips_unleveled() {
        let result = file(&FileStackOptions::default()).apply(payload("log", "plain"));
        assert!(!result.is_ok());

        let opts = FileStackOptions {
            include_log: true,
            ..Default::default()
        };
        assert!(file(&opts).apply(payload("log", "plain")).is_ok());
    }

    #[test]
    fn test_file_stack_meta_and_label() {
        let opts = FileStackOptions {
            label: true,
            meta: Some("meta".into()),
            timestamp: None,
            ..Default::default()
        };
        let result = file(&opts).apply(payload("warn", "x"));
        let row: Value = serde_json::from_str(result.payload.output().unwrap_or_default()).unwrap();
        assert_eq!(row["label"], json!("app"));
        assert_eq!(row["meta"], json!({"user": "milton"}));
        assert!(row.get("timestamp").is_none());
    }
}

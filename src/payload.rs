//! The payload flowing through loggers, transform stacks and transports
//!
//! A payload carries the user-visible record (`level`, `message` and open
//! metadata) plus three reserved slots that can never collide with user
//! keys: the immutable [`Source`] snapshot, the per-dispatch
//! [`DispatchConfig`] and the write-once rendered output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Level given to calls that name no level. Always passes level filters.
pub const LOG_LEVEL: &str = "log";

/// Direct write without line ending, bypasses transforms.
pub const WRITE_LEVEL: &str = "write";

/// Direct write with line ending, bypasses transforms.
pub const WRITE_LN_LEVEL: &str = "writeLn";

/// Severity ordered most severe first.
pub const DEFAULT_LEVELS: [&str; 6] = ["fatal", "error", "warn", "info", "debug", "trace"];

/// Style names per level. Rendering the styles is left to formatters.
pub type ColorTable = BTreeMap<String, Vec<String>>;

pub fn default_levels() -> Vec<String> {
    DEFAULT_LEVELS.iter().map(|l| l.to_string()).collect()
}

pub fn default_colors() -> ColorTable {
    let styles: [(&str, &[&str]); 6] = [
        ("fatal", &["bgRed", "white", "bold"]),
        ("error", &["red"]),
        ("warn", &["yellow"]),
        ("info", &["cyan"]),
        ("debug", &["magenta"]),
        ("trace", &["blue"]),
    ];
    styles
        .iter()
        .map(|(level, s)| (level.to_string(), s.iter().map(|v| v.to_string()).collect()))
        .collect()
}

/// True for the sentinel levels that bypass severity filtering.
pub fn is_unleveled(level: &str) -> bool {
    matches!(level, LOG_LEVEL | WRITE_LEVEL | WRITE_LN_LEVEL)
}

/// True for direct writes that skip the transform stack.
pub fn is_direct_write(level: &str) -> bool {
    matches!(level, WRITE_LEVEL | WRITE_LN_LEVEL)
}

/// Process-fatal event kinds an error can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalKind {
    Exception,
    Rejection,
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalKind::Exception => f.write_str("exception"),
            FatalKind::Rejection => f.write_str("rejection"),
        }
    }
}

/// An error value logged as a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// Set when the error arrived through a process-fatal handler.
    pub kind: Option<FatalKind>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            kind: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an error and its source chain. The chain is rendered as the
    /// stack, one cause per line.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = format!("Error: {}", err);
        let mut cause = err.source();
        while let Some(inner) = cause {
            stack.push_str(&format!("\n    caused by: {}", inner));
            cause = inner.source();
        }
        Self::new(err.to_string()).with_stack(stack)
    }

    #[must_use]
    pub fn tagged(mut self, kind: FatalKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn stack_or_message(&self) -> &str {
        self.stack.as_deref().unwrap_or(&self.message)
    }

    pub fn is_tagged(&self, kind: FatalKind) -> bool {
        self.kind == Some(kind)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Canonical record produced by call normalisation and snapshotted as the
/// payload's source.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub level: String,
    pub message: String,
    /// Positional format arguments followed by residual non-object args.
    pub splat: Vec<Value>,
    pub err: Option<ErrorInfo>,
    pub fields: Map<String, Value>,
}

impl Source {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            splat: Vec::new(),
            err: None,
            fields: Map::new(),
        }
    }
}

/// Read-only metadata attached per dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub label: String,
    pub levels: Arc<[String]>,
    pub colors: Arc<ColorTable>,
    /// Milliseconds since the owning logger's previous dispatch.
    pub elapsed_ms: u64,
    /// Label of the transport currently processing the payload.
    pub transport: Option<String>,
}

impl DispatchConfig {
    pub fn new(label: impl Into<String>, levels: Arc<[String]>) -> Self {
        Self {
            label: label.into(),
            levels,
            colors: Arc::new(ColorTable::new()),
            elapsed_ms: 0,
            transport: None,
        }
    }
}

/// The unit flowing through the system.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub level: String,
    pub message: String,
    /// Open user metadata.
    pub fields: Map<String, Value>,
    source: Arc<Source>,
    config: Arc<DispatchConfig>,
    output: Option<String>,
}

impl Payload {
    /// Attach a source snapshot and dispatch config to a normalised record.
    /// Internal-only values (`err`, `splat`) stay reachable through
    /// [`Payload::source`] only.
    pub fn new(record: Source, config: DispatchConfig) -> Self {
        Self {
            level: record.level.clone(),
            message: record.message.clone(),
            fields: record.fields.clone(),
            source: Arc::new(record),
            config: Arc::new(config),
            output: None,
        }
    }

    /// Rebuild a payload from a parsed row so transform stacks can render it.
    pub fn from_row(row: &Value, config: DispatchConfig) -> Self {
        let mut fields = row.as_object().cloned().unwrap_or_default();
        let level = take_string(&mut fields, "level").unwrap_or_else(|| LOG_LEVEL.to_string());
        let message = take_string(&mut fields, "message").unwrap_or_default();
        let mut record = Source::new(level, message);
        record.fields = fields;
        Self::new(record, config)
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Error captured when the logged message was an error value.
    pub fn err(&self) -> Option<&ErrorInfo> {
        self.source.err.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// User-visible object: level, message, then metadata.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("level".into(), Value::String(self.level.clone()));
        obj.insert("message".into(), Value::String(self.message.clone()));
        for (k, v) in &self.fields {
            if k != "level" && k != "message" {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Object(obj)
    }

    /// Only the transform stack and the direct-write path assign output.
    pub(crate) fn set_output(&mut self, output: String) {
        self.output = Some(output);
    }

    pub(crate) fn clear_output(&mut self) {
        self.output = None;
    }

    pub(crate) fn set_transport(&mut self, label: &str) {
        if self.config.transport.as_deref() != Some(label) {
            Arc::make_mut(&mut self.config).transport = Some(label.to_string());
        }
    }

    pub(crate) fn merge_fields(&mut self, meta: &Map<String, Value>) {
        for (k, v) in meta {
            self.fields.insert(k.clone(), v.clone());
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DispatchConfig {
        DispatchConfig::new("test", default_levels().into())
    }

    #[test]
    fn test_source_keeps_internal_fields() {
        let mut record = Source::new("info", "boom");
        record.splat = vec![json!(1)];
        record.err = Some(ErrorInfo::new("boom"));
        record.fields.insert("user".into(), json!("milton"));

        let payload = Payload::new(record, config());
        assert_eq!(payload.get("user"), Some(&json!("milton")));
        assert!(payload.get("err").is_none());
        assert!(payload.get("splat").is_none());
        assert_eq!(payload.source().splat, vec![json!(1)]);
        assert_eq!(payload.err().map(|e| e.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_source_is_unaffected_by_mutation() {
        let mut payload = Payload::new(Source::new("info", "original"), config());
        payload.message = "rewritten".into();
        payload.insert("extra", 1);
        assert_eq!(payload.source().message, "original");
        assert!(payload.source().fields.is_empty());
    }

    #[test]
    fn test_from_row() {
        let row = json!({"level": "warn", "message": "disk", "timestamp": "2024-01-01T00:00:00Z"});
        let payload = Payload::from_row(&row, config());
        assert_eq!(payload.level, "warn");
        assert_eq!(payload.message, "disk");
        assert!(payload.get("timestamp").is_some());
        assert_eq!(payload.to_value(), row);
    }

    #[test]
    fn test_error_info_from_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let info = ErrorInfo::from_error(&io);
        assert_eq!(info.message, "missing");
        assert_eq!(info.stack_or_message(), "Error: missing");
    }

    #[test]
    fn test_unleveled() {
        assert!(is_unleveled("log"));
        assert!(is_unleveled("writeLn"));
        assert!(!is_unleveled("info"));
        assert!(is_direct_write("write"));
        assert!(!is_direct_write("log"));
    }
}

//! Built-in modifiers
//!
//! Each function returns a [`UnitFactory`]; bind options with
//! [`UnitFactory::with`] or use [`UnitFactory::unit`] for the defaults.
//!
//! ```ignore
//! use logfan::transform::{combine, modifiers};
//! use serde_json::json;
//!
//! let stack = combine([
//!     modifiers::splat().unit(),
//!     modifiers::timestamp().with(json!({"format": "epoch"})),
//! ]);
//! ```

use super::{create_modifier, UnitFactory};
use crate::error::TransformError;
use crate::payload::{FatalKind, Payload, LOG_LEVEL};
use crate::printf::format_message;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

fn opt_str<'a>(options: &'a Value, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

fn opt_strings(options: &Value, key: &str) -> Option<Vec<String>> {
    options.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Merge the option object into the payload metadata.
pub fn extend() -> UnitFactory {
    create_modifier("extend", |mut payload: Payload, options: &Value| {
        if let Some(extra) = options.as_object() {
            payload.merge_fields(extra);
        }
        Ok(payload)
    })
}

/// Render the logger label through `template` (default `{label}:`) into
/// the `label` field.
pub fn label() -> UnitFactory {
    create_modifier("label", |mut payload: Payload, options: &Value| {
        let template = opt_str(options, "template").unwrap_or("{label}:");
        let rendered = template.replace("{label}", &payload.config().label);
        payload.insert("label", rendered);
        Ok(payload)
    })
}

/// Move metadata under a single property (`prop`, default `meta`), keeping
/// keys listed in `exclude` at the top level.
pub fn meta() -> UnitFactory {
    create_modifier("meta", |mut payload: Payload, options: &Value| {
        let prop = opt_str(options, "prop").unwrap_or("meta").to_string();
        if prop.is_empty() {
            return Ok(payload);
        }
        let exclude = opt_strings(options, "exclude").unwrap_or_default();

        let mut top = Map::new();
        let mut nested = Map::new();
        for (k, v) in std::mem::take(&mut payload.fields) {
            if exclude.contains(&k) {
                top.insert(k, v);
            } else {
                nested.insert(k, v);
            }
        }
        top.insert(prop, Value::Object(nested));
        payload.fields = top;
        Ok(payload)
    })
}

/// Stamp the payload with the current time.
///
/// `format` is one of `short` (default), `long`, `epoch` (milliseconds),
/// `rfc3339`, or any strftime pattern. An existing parseable value under
/// `prop` is reformatted rather than replaced by the current time.
pub fn timestamp() -> UnitFactory {
    create_modifier("timestamp", |mut payload: Payload, options: &Value| {
        let prop = opt_str(options, "prop").unwrap_or("timestamp").to_string();
        let format = opt_str(options, "format").unwrap_or("short");
        let at = payload
            .get(&prop)
            .and_then(crate::query::parse_timestamp)
            .unwrap_or_else(Utc::now);
        payload.insert(prop, format_timestamp(at, format));
        Ok(payload)
    })
}

pub(crate) fn format_timestamp(at: DateTime<Utc>, format: &str) -> Value {
    match format {
        "epoch" => Value::from(at.timestamp_millis()),
        "rfc3339" => Value::from(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        "short" => Value::from(at.format("%H:%M:%S%.3f").to_string()),
        "long" => Value::from(at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        pattern => {
            use std::fmt::Write;
            let mut out = String::new();
            // invalid strftime patterns fall back to rfc3339
            if write!(out, "{}", at.format(pattern)).is_err() {
                out = at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            }
            Value::from(out)
        }
    }
}

/// Interpolate the source splat arguments into the message.
pub fn splat() -> UnitFactory {
    create_modifier("splat", |mut payload: Payload, _: &Value| {
        if !payload.source().splat.is_empty() {
            payload.message = format_message(&payload.message, &payload.source().splat);
        }
        Ok(payload)
    })
}

/// Rewrite the message when the source carries an error.
///
/// `format`: `message` (unchanged), `stack` (default), `detail`
/// (`name: message`) or `detailstack` (detail followed by the stack frames).
pub fn errorify() -> UnitFactory {
    create_modifier("errorify", |mut payload: Payload, options: &Value| {
        let format = opt_str(options, "format").unwrap_or("stack");
        let Some(err) = payload.err().cloned() else {
            return Ok(payload);
        };
        payload.message = match format {
            "message" => return Ok(payload),
            "stack" => err.stack.clone().unwrap_or_else(|| payload.message.clone()),
            "detailstack" => {
                let frames: Vec<&str> = err
                    .stack
                    .as_deref()
                    .map(|s| s.lines().skip(1).collect())
                    .unwrap_or_default();
                let mut msg = format!("{}: {}", err.name, err.message);
                if !frames.is_empty() {
                    msg.push('\n');
                    msg.push_str(&frames.join("\n"));
                }
                msg
            }
            _ => format!("{}: {}", err.name, err.message),
        };
        Ok(payload)
    })
}

/// Replace scalar field values with a repeated mask character, e.g.
/// `{"password": "*"}`.
pub fn mask() -> UnitFactory {
    create_modifier("mask", |mut payload: Payload, options: &Value| {
        let Some(masks) = options.as_object() else {
            return Ok(payload);
        };
        for (key, ch) in masks {
            let Some(ch) = ch.as_str() else { continue };
            let masked = match payload.get(key) {
                None | Some(Value::Object(_)) | Some(Value::Array(_)) => continue,
                Some(Value::String(s)) => ch.repeat(s.chars().count()),
                Some(other) => ch.repeat(other.to_string().chars().count()),
            };
            payload.insert(key.clone(), masked);
        }
        Ok(payload)
    })
}

/// Drop the payload when `prop` (default `private`) is present. With a
/// `condition`, drop only when the value equals it.
pub fn private() -> UnitFactory {
    create_modifier("private", |payload: Payload, options: &Value| {
        let prop = opt_str(options, "prop").unwrap_or("private");
        let Some(value) = payload.get(prop) else {
            return Ok(payload);
        };
        match options.get("condition") {
            None => Err(TransformError::Rejected),
            Some(condition) if condition == value => Err(TransformError::Rejected),
            Some(_) => Ok(payload),
        }
    })
}

/// Pad the level to the width of the longest configured level.
/// `position` is `left` (default) or `right`; `char` defaults to a space.
pub fn pad() -> UnitFactory {
    create_modifier("pad", |mut payload: Payload, options: &Value| {
        let ch = opt_str(options, "char").unwrap_or(" ");
        let right = opt_str(options, "position") == Some("right");
        let width = payload
            .config()
            .levels
            .iter()
            .map(|l| l.chars().count())
            .max()
            .unwrap_or(0);
        let len = (width + 1).saturating_sub(payload.source().level.chars().count());
        let padding: String = ch.chars().cycle().take(len).collect();
        payload.level = if right {
            format!("{}{}", payload.level, padding)
        } else {
            format!("{}{}", padding, payload.level)
        };
        Ok(payload)
    })
}

/// Reject unleveled `log()` payloads; used by the file stack unless
/// `include_log` is set.
pub fn leveled_only() -> UnitFactory {
    create_modifier("leveled_only", |payload: Payload, _: &Value| {
        if payload.source().level == LOG_LEVEL {
            Err(TransformError::Rejected)
        } else {
            Ok(payload)
        }
    })
}

/// Read `level`, `message` or a metadata field as a scalar string.
fn prop_string(payload: &Payload, key: &str) -> Option<String> {
    match key {
        "level" => Some(payload.level.clone()),
        "message" => Some(payload.message.clone()),
        _ => match payload.get(key)? {
            Value::Object(_) | Value::Array(_) | Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        },
    }
}

fn set_prop(payload: &mut Payload, key: &str, value: String) {
    match key {
        "level" => payload.level = value,
        "message" => payload.message = value,
        _ => payload.insert(key, value),
    }
}

/// Prefix `props` (default `["message"]`) with `char` (default a tab).
pub fn align() -> UnitFactory {
    create_modifier("align", |mut payload: Payload, options: &Value| {
        let ch = opt_str(options, "char").unwrap_or("\t");
        let props = opt_strings(options, "props").unwrap_or_else(|| vec!["message".to_string()]);
        for prop in &props {
            if let Some(current) = prop_string(&payload, prop) {
                set_prop(&mut payload, prop, format!("{}{}", ch, current));
            }
        }
        Ok(payload)
    })
}

fn words(value: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in value.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn change_case(value: &str, case: &str) -> Option<String> {
    let converted = match case {
        "cap" | "capitalize" => capitalize(value),
        "lower" | "lowercase" => value.to_lowercase(),
        "upper" | "uppercase" => value.to_uppercase(),
        "camel" | "camelcase" => words(value)
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let w = w.to_lowercase();
                if i == 0 { w } else { capitalize(&w) }
            })
            .collect(),
        "pascal" | "pascalcase" => words(value)
            .iter()
            .map(|w| capitalize(&w.to_lowercase()))
            .collect(),
        _ => return None,
    };
    Some(converted)
}

/// Change the case of scalar properties, e.g. `{"level": "upper"}`.
///
/// Cases: `cap`, `lower`, `upper`, `camel`, `pascal` and their long forms.
/// Unknown cases and object values are left alone.
pub fn case() -> UnitFactory {
    create_modifier("case", |mut payload: Payload, options: &Value| {
        let Some(cases) = options.as_object() else {
            return Ok(payload);
        };
        for (prop, case) in cases {
            let Some(case) = case.as_str() else { continue };
            let Some(current) = prop_string(&payload, prop) else { continue };
            if let Some(converted) = change_case(&current, case) {
                set_prop(&mut payload, prop, converted);
            }
        }
        Ok(payload)
    })
}

/// Reorder metadata by `props`. A `"..."` entry stands for every field not
/// listed; without one, unlisted fields are dropped. Without `props`
/// fields are sorted by key.
pub fn sort() -> UnitFactory {
    create_modifier("sort", |mut payload: Payload, options: &Value| {
        let mut fields = std::mem::take(&mut payload.fields);
        let Some(props) = opt_strings(options, "props") else {
            let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            payload.fields = entries.into_iter().collect();
            return Ok(payload);
        };

        let order: Vec<String> = match props.iter().position(|p| p == "...") {
            None => props.clone(),
            Some(idx) => {
                let unlisted = fields.keys().filter(|k| !props.contains(k)).cloned();
                props[..idx]
                    .iter()
                    .cloned()
                    .chain(unlisted.collect::<Vec<_>>())
                    .chain(props[idx + 1..].iter().cloned())
                    .collect()
            }
        };
        for key in order {
            if let Some(value) = fields.remove(&key) {
                payload.fields.insert(key, value);
            }
        }
        Ok(payload)
    })
}

fn frame_value(function: Option<String>, location: &str) -> Value {
    let mut parts = location.rsplitn(3, ':');
    let (column, line, file) = match (parts.next(), parts.next(), parts.next()) {
        (Some(col), Some(line), Some(file)) => match (col.parse::<u64>(), line.parse::<u64>()) {
            (Ok(col), Ok(line)) => (Some(col), Some(line), file.to_string()),
            _ => (None, None, location.to_string()),
        },
        _ => (None, None, location.to_string()),
    };
    let base = std::path::Path::new(&file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let short = match (line, column) {
        (Some(line), Some(col)) => format!("{} {}:{}", base, line, col),
        _ => base,
    };
    serde_json::json!({
        "function": function,
        "file": file,
        "line": line,
        "column": column,
        "short": short,
    })
}

/// Parse `at function (file:line:col)` / `at file:line:col` frames and the
/// numbered `N: function` / `at file:line:col` pairs of a captured
/// backtrace.
pub(crate) fn parse_frames(stack: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    let mut function: Option<String> = None;

    for line in stack.lines().map(str::trim) {
        if let Some((index, name)) = line.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                if let Some(pending) = function.take() {
                    frames.push(frame_value(Some(pending), ""));
                }
                function = Some(name.to_string());
                continue;
            }
        }
        let Some(at) = line.strip_prefix("at ") else { continue };
        match at.strip_suffix(')').and_then(|a| a.split_once(" (")) {
            Some((name, location)) => {
                if let Some(pending) = function.take() {
                    frames.push(frame_value(Some(pending), ""));
                }
                frames.push(frame_value(Some(name.to_string()), location));
            }
            None => frames.push(frame_value(function.take(), at)),
        }
    }
    if let Some(pending) = function {
        frames.push(frame_value(Some(pending), ""));
    }
    frames
}

/// Attach parsed stack frames under `trace`.
///
/// By default only tagged exceptions and rejections are traced, from the
/// error's own stack. `all` traces every payload, capturing the current
/// backtrace when no error stack exists.
pub fn trace() -> UnitFactory {
    create_modifier("trace", |mut payload: Payload, options: &Value| {
        let flag = |key: &str, default: bool| options.get(key).and_then(Value::as_bool).unwrap_or(default);
        let err = payload.err();
        let kind = err.and_then(|e| e.kind);
        let traced = flag("all", false)
            || (flag("exceptions", true) && kind == Some(FatalKind::Exception))
            || (flag("rejections", true) && kind == Some(FatalKind::Rejection));
        if !traced {
            return Ok(payload);
        }

        let stack = match err.and_then(|e| e.stack.clone()) {
            Some(stack) => stack,
            None => std::backtrace::Backtrace::force_capture().to_string(),
        };
        let frames = parse_frames(&stack);
        payload.insert("trace", Value::Array(frames));
        Ok(payload)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{default_levels, DispatchConfig, ErrorInfo, Source};
    use crate::transform::combine;
    use serde_json::json;

    fn payload_with(record: Source) -> Payload {
        Payload::new(record, DispatchConfig::new("app", default_levels().into()))
    }

    fn payload(level: &str, message: &str) -> Payload {
        payload_with(Source::new(level, message))
    }

    #[test]
    fn test_extend_and_label() {
        let stack = combine([extend().with(json!({"pid": 42})), label().unit()]);
        let out = stack.apply(payload("info", "hello")).payload;
        assert_eq!(out.get("pid"), Some(&json!(42)));
        assert_eq!(out.get("label"), Some(&json!("app:")));
    }

    #[test]
    fn test_meta_moves_fields() {
        let mut record = Source::new("info", "x");
        record.fields.insert("user".into(), json!("milton"));
        record.fields.insert("keep".into(), json!(true));
        let out = meta()
            .with(json!({"exclude": ["keep"]}))
            .pipe(payload_with(record));
        assert_eq!(out.get("keep"), Some(&json!(true)));
        assert_eq!(out.get("meta"), Some(&json!({"user": "milton"})));
    }

    #[test]
    fn test_timestamp_formats() {
        let mut record = Source::new("info", "x");
        record.fields.insert("timestamp".into(), json!("2024-03-01T10:20:30.456Z"));
        let p = payload_with(record);

        let epoch = timestamp().with(json!({"format": "epoch"})).pipe(p.clone());
        assert_eq!(epoch.get("timestamp"), Some(&json!(1709288430456i64)));

        let short = timestamp().unit().pipe(p.clone());
        assert_eq!(short.get("timestamp"), Some(&json!("10:20:30.456")));

        let custom = timestamp()
            .with(json!({"format": "%Y/%m/%d", "prop": "day"}))
            .pipe(payload("info", "x"));
        assert!(custom.get("day").and_then(Value::as_str).is_some());
    }

    #[test]
    fn test_splat_interpolates() {
        let mut record = Source::new("info", "my name is %s");
        record.splat = vec![json!("milton"), json!("waddams")];
        let out = splat().unit().pipe(payload_with(record));
        assert_eq!(out.message, "my name is milton waddams");
    }

    #[test]
    fn test_errorify_variants() {
        let mut record = Source::new("error", "boom");
        record.err = Some(ErrorInfo::named("TypeError", "boom").with_stack("TypeError: boom\n    at a\n    at b"));
        let p = payload_with(record);

        let stack = errorify().unit().pipe(p.clone());
        assert_eq!(stack.message, "TypeError: boom\n    at a\n    at b");

        let detail = errorify().with(json!({"format": "detail"})).pipe(p.clone());
        assert_eq!(detail.message, "TypeError: boom");

        let detailstack = errorify().with(json!({"format": "detailstack"})).pipe(p);
        assert_eq!(detailstack.message, "TypeError: boom\n    at a\n    at b");

        let plain = errorify().unit().pipe(payload("info", "fine"));
        assert_eq!(plain.message, "fine");
    }

    #[test]
    fn test_mask_scalars_only() {
        let mut record = Source::new("info", "x");
        record.fields.insert("password".into(), json!("hunter2"));
        record.fields.insert("pin".into(), json!(1234));
        record.fields.insert("nested".into(), json!({"a": 1}));
        let out = mask()
            .with(json!({"password": "*", "pin": "#", "nested": "*"}))
            .pipe(payload_with(record));
        assert_eq!(out.get("password"), Some(&json!("*******")));
        assert_eq!(out.get("pin"), Some(&json!("####")));
        assert_eq!(out.get("nested"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_private_rejects() {
        let mut record = Source::new("info", "secret");
        record.fields.insert("private".into(), json!(true));
        let p = payload_with(record);

        let result = combine([private().unit()]).apply(p.clone());
        assert_eq!(result.errors[0].1, TransformError::Rejected);

        let result = combine([private().with(json!({"condition": false}))]).apply(p);
        assert!(result.is_ok());
    }

    #[test]
    fn test_pad_level() {
        let left = pad().unit().pipe(payload("info", "x"));
        assert_eq!(left.level, "  info");
        let right = pad().with(json!({"position": "right", "char": "."})).pipe(payload("error", "x"));
        assert_eq!(right.level, "error.");
    }

    #[test]
    fn test_leveled_only() {
        let result = combine([leveled_only().unit()]).apply(payload("log", "plain"));
        assert!(!result.is_ok());
        let result = combine([leveled_only().unit()]).apply(payload("info", "leveled"));
        assert!(result.is_ok());
    }

    #[test]
    fn test_align_prefixes_props() {
        let out = align().unit().pipe(payload("info", "hello"));
        assert_eq!(out.message, "\thello");

        let mut record = Source::new("warn", "x");
        record.fields.insert("user".into(), json!("milton"));
        let out = align()
            .with(json!({"char": ">", "props": ["level", "user", "missing"]}))
            .pipe(payload_with(record));
        assert_eq!(out.level, ">warn");
        assert_eq!(out.get("user"), Some(&json!(">milton")));
        assert_eq!(out.get("missing"), None);
    }

    #[test]
    fn test_case_conversions() {
        let mut record = Source::new("info", "stapler missing");
        record.fields.insert("user".into(), json!("milton waddams"));
        record.fields.insert("dept".into(), json!("basement-storage_b"));
        record.fields.insert("nested".into(), json!({"a": "b"}));
        let out = case()
            .with(json!({
                "level": "upper",
                "message": "cap",
                "user": "pascal",
                "dept": "camel",
                "nested": "upper",
                "missing": "lower",
            }))
            .pipe(payload_with(record));
        assert_eq!(out.level, "INFO");
        assert_eq!(out.message, "Stapler missing");
        assert_eq!(out.get("user"), Some(&json!("MiltonWaddams")));
        assert_eq!(out.get("dept"), Some(&json!("basementStorageB")));
        assert_eq!(out.get("nested"), Some(&json!({"a": "b"})));
        assert_eq!(change_case("fooBar baz", "camelcase").as_deref(), Some("fooBarBaz"));
        assert_eq!(change_case("x", "sideways"), None);
    }

    #[test]
    fn test_sort_fields() {
        let mut record = Source::new("info", "x");
        record.fields.insert("zeta".into(), json!(1));
        record.fields.insert("alpha".into(), json!(2));
        record.fields.insert("mid".into(), json!(3));
        let p = payload_with(record);

        let keys = |out: &Payload| out.fields.keys().cloned().collect::<Vec<_>>();

        let sorted = sort().unit().pipe(p.clone());
        assert_eq!(keys(&sorted), vec!["alpha", "mid", "zeta"]);

        let filled = sort().with(json!({"props": ["mid", "..."]})).pipe(p.clone());
        assert_eq!(keys(&filled), vec!["mid", "zeta", "alpha"]);

        let only = sort().with(json!({"props": ["zeta", "mid", "absent"]})).pipe(p);
        assert_eq!(keys(&only), vec!["zeta", "mid"]);
    }

    #[test]
    fn test_trace_tagged_errors() {
        let mut record = Source::new("fatal", "boom");
        let mut err = ErrorInfo::named("Panic", "boom")
            .with_stack("Panic: boom\n    at handle (src/worker.rs:12:9)\n    at src/main.rs:40:5");
        err.kind = Some(FatalKind::Exception);
        record.err = Some(err);
        let out = trace().unit().pipe(payload_with(record));
        let frames = out.get("trace").and_then(Value::as_array).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["function"], "handle");
        assert_eq!(frames[0]["line"], 12);
        assert_eq!(frames[0]["short"], "worker.rs 12:9");
        assert_eq!(frames[1]["function"], Value::Null);
        assert_eq!(frames[1]["file"], "src/main.rs");

        let untagged = trace().unit().pipe(payload("info", "fine"));
        assert!(untagged.get("trace").is_none());

        let all = trace().with(json!({"all": true})).pipe(payload("info", "fine"));
        assert!(all.get("trace").and_then(Value::as_array).is_some());
    }

    #[test]
    fn test_parse_backtrace_frames() {
        let frames = parse_frames(
            "   0: app::worker::run\n             at ./src/worker.rs:7:3\n   1: std::rt::lang_start\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["function"], "app::worker::run");
        assert_eq!(frames[0]["column"], 3);
        assert_eq!(frames[1]["function"], "std::rt::lang_start");
        assert_eq!(frames[1]["file"], "");
    }

    trait Pipe {
        fn pipe(&self, payload: Payload) -> Payload;
    }

    impl Pipe for crate::transform::TransformUnit {
        fn pipe(&self, payload: Payload) -> Payload {
            let result = combine([self.clone()]).apply(payload);
            assert!(result.is_ok(), "{:?}", result.errors);
            result.payload
        }
    }
}

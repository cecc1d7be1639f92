//! Log call arguments and call-shape normalisation

use crate::payload::{is_unleveled, ErrorInfo, Payload, Source, LOG_LEVEL};
use crate::printf::{count_tokens, display};
use serde_json::{Map, Value};
use std::fmt;

/// Completion callback receiving the dispatched payload.
pub type Callback = Box<dyn FnOnce(&Payload) + Send>;

/// One positional argument of a log call.
pub enum Arg {
    Str(String),
    Value(Value),
    Error(ErrorInfo),
    Callback(Callback),
}

impl Arg {
    pub fn callback(f: impl FnOnce(&Payload) + Send + 'static) -> Self {
        Arg::Callback(Box::new(f))
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Arg::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Arg::Str(s),
            other => Arg::Value(other),
        }
    }
}

impl From<Map<String, Value>> for Arg {
    fn from(m: Map<String, Value>) -> Self {
        Arg::Value(Value::Object(m))
    }
}

impl From<ErrorInfo> for Arg {
    fn from(e: ErrorInfo) -> Self {
        Arg::Error(e)
    }
}

macro_rules! scalar_arg {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                Arg::Value(Value::from(v))
            }
        })*
    };
}

scalar_arg!(i32, i64, u32, u64, usize, f64, bool);

/// Build a `Vec<Arg>` from heterogeneous values.
///
/// ```ignore
/// logger.log(args!["info", "user %s logged in", "milton", json!({"id": 7})])?;
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Arg>::new() };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::Arg::from($arg)),+]
    };
}

/// How a call was made, decided before any normalisation.
#[derive(Debug)]
pub(crate) enum CallShape {
    Empty,
    /// First argument names a level.
    Level { level: String, rest: Vec<Arg> },
    /// First argument is the message.
    Message { message: Arg, rest: Vec<Arg> },
    /// First argument is a record object.
    Object { record: Map<String, Value>, rest: Vec<Arg> },
}

impl CallShape {
    pub(crate) fn classify(levels: &[String], mut args: Vec<Arg>) -> Self {
        if args.is_empty() {
            return CallShape::Empty;
        }
        let first = args.remove(0);
        match first {
            Arg::Str(s) if levels.contains(&s) => CallShape::Level { level: s, rest: args },
            Arg::Value(Value::Object(record)) => CallShape::Object { record, rest: args },
            message => CallShape::Message { message, rest: args },
        }
    }
}

/// Normalise a raw call into a source record and its callback.
///
/// A trailing callback is detached first. Leading splat entries consumed
/// by printf tokens stay positional; of the rest, objects merge into the
/// metadata (later wins) and everything else is appended to the splat.
pub(crate) fn normalize(levels: &[String], mut args: Vec<Arg>) -> (Source, Option<Callback>) {
    let callback = if matches!(args.last(), Some(Arg::Callback(_))) {
        match args.pop() {
            Some(Arg::Callback(cb)) => Some(cb),
            _ => None,
        }
    } else {
        None
    };
    args.retain(|a| !matches!(a, Arg::Callback(_)));

    let (level, message, splat, mut fields) = match CallShape::classify(levels, args) {
        CallShape::Empty => (LOG_LEVEL.to_string(), None, Vec::new(), Map::new()),
        CallShape::Level { level, mut rest } => {
            let message = (!rest.is_empty()).then(|| rest.remove(0));
            (level, message, rest, Map::new())
        }
        CallShape::Message { message, rest } => (LOG_LEVEL.to_string(), Some(message), rest, Map::new()),
        CallShape::Object { mut record, rest } => {
            let level = match record.remove("level") {
                Some(Value::String(l)) if levels.contains(&l) || is_unleveled(&l) => l,
                _ => LOG_LEVEL.to_string(),
            };
            let message = record.remove("message").map(Arg::from);
            (level, message, rest, record)
        }
    };

    let mut err = None;
    let message = match message {
        None => String::new(),
        Some(Arg::Str(s)) => s,
        Some(Arg::Error(e)) => {
            let text = e.message.clone();
            err = Some(e);
            text
        }
        Some(Arg::Value(Value::Object(meta))) => {
            fields.extend(meta);
            String::new()
        }
        Some(Arg::Value(v)) => display(&v),
        Some(Arg::Callback(_)) => String::new(),
    };

    let tokens = count_tokens(&message);
    let mut positional = Vec::new();
    let mut residual = Vec::new();
    for (i, arg) in splat.into_iter().enumerate() {
        let value = match arg {
            Arg::Str(s) => Value::String(s),
            Arg::Value(v) => v,
            Arg::Error(e) => Value::String(e.to_string()),
            Arg::Callback(_) => continue,
        };
        if i < tokens {
            positional.push(value);
        } else if let Value::Object(meta) = value {
            fields.extend(meta);
        } else if !value.is_null() {
            residual.push(value);
        }
    }
    positional.extend(residual);

    let mut level = level;
    let mut message = message;
    if let Some(Value::String(l)) = fields.remove("level") {
        if levels.contains(&l) || is_unleveled(&l) {
            level = l;
        }
    }
    if let Some(m) = fields.remove("message") {
        message = display(&m);
    }

    let mut record = Source::new(level, message);
    record.splat = positional;
    record.err = err;
    record.fields = fields;
    (record, callback)
}

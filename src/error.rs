//! Error types shared across the crate

use thiserror::Error;

/// Misconfiguration detected while building loggers or transports.
///
/// These are raised synchronously at construction time and are never
/// recovered from internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot init logger \"{label}\" using an empty level list")]
    EmptyLevels { label: String },

    #[error("logger \"{label}\" already exists, choose another label or force recreation")]
    DuplicateLogger { label: String },

    #[error("child logger \"{label}\" already exists")]
    DuplicateChild { label: String },

    #[error("transport \"{label}\" is already attached to logger \"{owner}\"")]
    TransportAttached { label: String, owner: String },

    #[error("transport label \"{label}\" is already in use")]
    DuplicateTransport { label: String },

    #[error("transport \"{label}\" was built without a sink")]
    MissingSink { label: String },

    #[error("level \"{level}\" is not one of [{levels}]")]
    UnknownLevel { level: String, levels: String },

    #[error("invalid {what} \"{value}\"")]
    InvalidValue { what: &'static str, value: String },
}

/// Non-throwing failure signalled by a transform unit.
///
/// A unit returning one of these aborts the remaining stack and the payload
/// is dropped for the transport that ran it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("payload rejected")]
    Rejected,

    #[error("{0}")]
    Failed(String),
}

impl TransformError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Fatal dispatch failures. These signal a defect rather than a
/// recoverable condition and are returned to the caller of `log`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("transform unit panicked in transport \"{transport}\": {message}")]
    TransformPanicked { transport: String, message: String },

    #[error("logger \"{label}\" is closed")]
    Closed { label: String },
}

/// Failure inside a concrete sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid sink configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("sink \"{0}\" is closed")]
    Closed(String),

    #[error("sink panicked: {0}")]
    Panicked(String),
}

/// Per-source query failure.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse row: {0}")]
    Parse(String),

    #[error("query source failed: {0}")]
    Source(String),
}

/// Failure that terminates a file tail.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Recover the guard from a poisoned lock; registry state stays usable
/// after a panicking transform.
pub(crate) fn unpoison<T>(result: std::sync::LockResult<T>) -> T {
    result.unwrap_or_else(std::sync::PoisonError::into_inner)
}

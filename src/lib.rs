//! logfan: leveled, multi-destination structured logging
//!
//! A [`Logger`] normalises each call into a [`Payload`], runs it through
//! per-transport transform stacks and fans it out to every attached
//! [`Transport`]. Written output can be read back with a [`Query`] or
//! followed live through a [`Firehose`].

pub mod config;
pub mod error;
pub mod fatal;
pub mod firehose;
pub mod logger;
pub mod payload;
pub mod printf;
pub mod query;
pub mod tail;
pub mod tracing_layer;
pub mod transform;
pub mod transport;

// Re-export commonly used types
pub use config::LogfanConfig;
pub use error::{ConfigError, LogError, QueryError, SinkError, TailError, TransformError};
pub use fatal::{report_exception, report_rejection, ExitOutcome, HandlerState, ProcessTerminator, Terminator};
pub use firehose::{Firehose, FirehoseEvent, SinkFeed};
pub use logger::{Arg, ChildLogger, Log, Logger, LoggerEvent, LoggerOptions, LoggerRegistry, MuteScope};
pub use payload::{DispatchConfig, ErrorInfo, FatalKind, Payload, Source};
pub use query::{Query, QueryOptions, QueryReport, QuerySource, SortOrder};
pub use tail::{tail, TailEvent, TailHandle, TailOptions, TailStart};
pub use tracing_layer::TracingBridge;
pub use transform::{combine, create_formatter, create_modifier, Transform, TransformStack, TransformUnit};
pub use transport::{ConsoleSink, FileSink, FileSinkOptions, Frequency, MemorySink, Sink, Transport, TransportEvent, TransportOptions, TransportState};

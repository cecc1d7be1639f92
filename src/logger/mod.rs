//! Loggers: payload construction, fan-out and lifecycle
//!
//! A [`Logger`] normalises each call into a [`Payload`], stamps it with the
//! dispatch config and writes it to every attached [`Transport`] in turn.
//! Children share the parent's transports and merge a fixed metadata patch
//! into every record they emit.

pub mod args;
pub mod child;
pub mod registry;

pub use args::{Arg, Callback};
pub use child::ChildLogger;
pub use registry::LoggerRegistry;

use crate::error::{unpoison, ConfigError, LogError};
use crate::fatal::{self, HandlerState, ProcessTerminator, SubscriptionId, Terminator};
use crate::firehose::Firehose;
use crate::payload::{
    default_colors, default_levels, ColorTable, DispatchConfig, ErrorInfo, FatalKind, Payload,
    Source, WRITE_LEVEL, WRITE_LN_LEVEL,
};
use crate::printf::display;
use crate::query::{Query, QueryOptions};
use crate::transform::{combine, Transform, TransformStack};
use crate::transport::Transport;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use child::ChildState;

const EVENT_CAPACITY: usize = 256;

/// Notifications published on a logger's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerEvent {
    /// A transport's sink failed.
    Error { transport: String, message: String },
    /// Operator warning; `source` is the logger or transport label.
    Warn { source: String, message: String },
    Closed { logger: String },
}

/// Which loggers `mute` and `unmute` apply to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuteScope {
    Logger,
    AllChildren,
    Children(Vec<String>),
}

#[derive(Clone)]
pub struct LoggerOptions {
    /// Ordered most severe first. Defaults to the six standard levels.
    pub levels: Option<Vec<String>>,
    pub colors: Option<ColorTable>,
    pub transports: Vec<Transport>,
    /// Fallback units for transports that declare none.
    pub transforms: Vec<Transform>,
    pub muted: bool,
    pub error_exit: bool,
    pub exit_grace: Duration,
    pub terminator: Arc<dyn Terminator>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            levels: None,
            colors: None,
            transports: Vec::new(),
            transforms: Vec::new(),
            muted: false,
            error_exit: false,
            exit_grace: fatal::DEFAULT_EXIT_GRACE,
            terminator: Arc::new(ProcessTerminator),
        }
    }
}

impl std::fmt::Debug for LoggerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerOptions")
            .field("levels", &self.levels)
            .field("transports", &self.transports)
            .field("muted", &self.muted)
            .field("error_exit", &self.error_exit)
            .field("exit_grace", &self.exit_grace)
            .finish_non_exhaustive()
    }
}

struct Handler {
    state: HandlerState,
    subscription: Option<SubscriptionId>,
}

struct LoggerInner {
    label: String,
    levels: Arc<[String]>,
    colors: Arc<ColorTable>,
    stack: TransformStack,
    transports: Mutex<Vec<Transport>>,
    children: Mutex<BTreeMap<String, Arc<ChildState>>>,
    muted: AtomicBool,
    closed: AtomicBool,
    last_dispatch: Mutex<Option<Instant>>,
    warned_empty: AtomicBool,
    profiles: Mutex<HashMap<String, Instant>>,
    events: broadcast::Sender<LoggerEvent>,
    error_exit: AtomicBool,
    exit_grace: Duration,
    terminator: Arc<dyn Terminator>,
    handlers: Mutex<HashMap<FatalKind, Handler>>,
}

impl Drop for LoggerInner {
    fn drop(&mut self) {
        let handlers = self
            .handlers
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handler in handlers.values_mut() {
            if let Some(id) = handler.subscription.take() {
                fatal::unsubscribe(id);
            }
        }
    }
}

/// Shared handle to a logger.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("label", &self.inner.label)
            .field("levels", &self.inner.levels)
            .field("transports", &self.transport_labels())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Level helpers shared by loggers and children.
pub trait Log {
    /// Normalise `args` into a payload and dispatch it.
    fn log(&self, args: Vec<Arg>) -> Result<Payload, LogError>;

    fn log_at(&self, level: &str, mut args: Vec<Arg>) -> Result<Payload, LogError> {
        args.insert(0, Arg::from(level));
        self.log(args)
    }

    fn fatal(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("fatal", vec![message.into()])
    }

    fn error(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("error", vec![message.into()])
    }

    fn warn(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("warn", vec![message.into()])
    }

    fn info(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("info", vec![message.into()])
    }

    fn debug(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("debug", vec![message.into()])
    }

    fn trace(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.log_at("trace", vec![message.into()])
    }
}

impl Log for Logger {
    fn log(&self, args: Vec<Arg>) -> Result<Payload, LogError> {
        self.check_open()?;
        let (record, callback) = args::normalize(&self.inner.levels, args);
        if self.is_muted() {
            return Ok(Payload::new(record, self.dispatch_config(&self.inner.label, 0)));
        }
        self.emit(record, &self.inner.label, callback)
    }
}

impl Logger {
    pub fn new(label: impl Into<String>, options: LoggerOptions) -> Result<Self, ConfigError> {
        let label = label.into();
        let (levels, colors) = match options.levels {
            Some(levels) if levels.is_empty() => return Err(ConfigError::EmptyLevels { label }),
            Some(levels) => (levels, options.colors.unwrap_or_default()),
            None => (
                default_levels(),
                options.colors.unwrap_or_else(default_colors),
            ),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let logger = Self {
            inner: Arc::new(LoggerInner {
                label,
                levels: levels.into(),
                colors: Arc::new(colors),
                stack: combine(options.transforms),
                transports: Mutex::new(Vec::new()),
                children: Mutex::new(BTreeMap::new()),
                muted: AtomicBool::new(options.muted),
                closed: AtomicBool::new(false),
                last_dispatch: Mutex::new(None),
                warned_empty: AtomicBool::new(false),
                profiles: Mutex::new(HashMap::new()),
                events,
                error_exit: AtomicBool::new(options.error_exit),
                exit_grace: options.exit_grace,
                terminator: options.terminator,
                handlers: Mutex::new(HashMap::new()),
            }),
        };

        for transport in options.transports {
            logger.add_transport(transport)?;
        }
        Ok(logger)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn levels(&self) -> &[String] {
        &self.inner.levels
    }

    pub fn colors(&self) -> &ColorTable {
        &self.inner.colors
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoggerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn set_error_exit(&self, enabled: bool) {
        self.inner.error_exit.store(enabled, Ordering::SeqCst);
    }

    // TRANSPORTS //

    /// Attach a transport. Transports flagged for exceptions or rejections
    /// arm the matching handler.
    pub fn add_transport(&self, transport: Transport) -> Result<(), ConfigError> {
        {
            let mut transports = unpoison(self.inner.transports.lock());
            if transports.iter().any(|t| t.label() == transport.label()) {
                return Err(ConfigError::DuplicateTransport {
                    label: transport.label().to_string(),
                });
            }
            transport.attach(
                &self.inner.label,
                self.inner.levels.clone(),
                &self.inner.stack,
                self.inner.events.clone(),
            )?;
            transports.push(transport.clone());
        }

        for kind in [FatalKind::Exception, FatalKind::Rejection] {
            if transport.handles(kind) {
                self.arm(kind);
            }
        }
        tracing::debug!(logger = %self.inner.label, transport = %transport.label(), "transport attached");
        Ok(())
    }

    /// Detach a transport, closing it.
    pub fn remove_transport(&self, label: &str) -> Option<Transport> {
        let removed = {
            let mut transports = unpoison(self.inner.transports.lock());
            let index = transports.iter().position(|t| t.label() == label)?;
            transports.remove(index)
        };
        removed.detach();
        Some(removed)
    }

    pub fn transport(&self, label: &str) -> Option<Transport> {
        unpoison(self.inner.transports.lock())
            .iter()
            .find(|t| t.label() == label)
            .cloned()
    }

    pub fn transports(&self) -> Vec<Transport> {
        unpoison(self.inner.transports.lock()).clone()
    }

    pub fn transport_labels(&self) -> Vec<String> {
        unpoison(self.inner.transports.lock())
            .iter()
            .map(|t| t.label().to_string())
            .collect()
    }

    /// The named transports, or all of them when `labels` is empty.
    fn select(&self, labels: &[&str]) -> Vec<Transport> {
        let transports = unpoison(self.inner.transports.lock());
        if labels.is_empty() {
            return transports.clone();
        }
        transports
            .iter()
            .filter(|t| labels.contains(&t.label()))
            .cloned()
            .collect()
    }

    // DISPATCH //

    fn check_open(&self) -> Result<(), LogError> {
        if self.is_closed() {
            return Err(LogError::Closed {
                label: self.inner.label.clone(),
            });
        }
        Ok(())
    }

    fn dispatch_config(&self, label: &str, elapsed_ms: u64) -> DispatchConfig {
        let mut config = DispatchConfig::new(label, self.inner.levels.clone());
        config.colors = self.inner.colors.clone();
        config.elapsed_ms = elapsed_ms;
        config
    }

    /// Milliseconds since the previous dispatch, zero on the first.
    fn tick(&self) -> u64 {
        let now = Instant::now();
        let mut last = unpoison(self.inner.last_dispatch.lock());
        let elapsed = last.map_or(0, |prev| now.duration_since(prev).as_millis() as u64);
        *last = Some(now);
        elapsed
    }

    fn build(&self, record: Source, label: &str) -> Payload {
        let elapsed = self.tick();
        Payload::new(record, self.dispatch_config(label, elapsed))
    }

    /// Build, dispatch and run the completion callback.
    pub(crate) fn emit(
        &self,
        record: Source,
        label: &str,
        callback: Option<Callback>,
    ) -> Result<Payload, LogError> {
        let payload = self.build(record, label);
        self.dispatch(&payload)?;
        if let Some(callback) = callback {
            callback(&payload);
        }
        Ok(payload)
    }

    /// Write to every transport in attachment order. Every transport gets
    /// its copy; the first fatal error is returned afterwards.
    fn dispatch(&self, payload: &Payload) -> Result<(), LogError> {
        let transports = self.transports();
        if transports.is_empty() {
            self.warn_empty(payload);
            return Ok(());
        }

        let relay = payload
            .err()
            .and_then(|e| e.kind)
            .filter(|kind| self.handler_state(*kind) != HandlerState::Unarmed);

        let mut first = None;
        for transport in &transports {
            if let Err(err) = transport.write(payload.clone()) {
                first.get_or_insert(err);
            }
            if let Some(kind) = relay {
                if transport.handles(kind) {
                    transport.relay(payload.clone());
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn dispatch_batch(&self, payloads: Vec<Payload>) -> Result<(), LogError> {
        let transports = self.transports();
        if transports.is_empty() {
            if let Some(first) = payloads.first() {
                self.warn_empty(first);
            }
            return Ok(());
        }
        let mut first = None;
        for transport in &transports {
            if let Err(err) = transport.write_batch(payloads.clone()) {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn warn_empty(&self, payload: &Payload) {
        if self.inner.warned_empty.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            logger = %self.inner.label,
            level = %payload.level,
            message = %payload.message,
            "logger has no transports, payload dropped"
        );
        self.publish(LoggerEvent::Warn {
            source: self.inner.label.clone(),
            message: "logger has no transports".to_string(),
        });
    }

    fn publish(&self, event: LoggerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Direct write without line ending.
    pub fn write(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.direct(WRITE_LEVEL, stringify(message.into()))
    }

    /// Direct write with line ending.
    pub fn write_ln(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.direct(WRITE_LN_LEVEL, stringify(message.into()) + "\n")
    }

    fn direct(&self, level: &str, message: String) -> Result<Payload, LogError> {
        self.check_open()?;
        let record = Source::new(level, message);
        if self.is_muted() {
            return Ok(Payload::new(record, self.dispatch_config(&self.inner.label, 0)));
        }
        self.emit(record, &self.inner.label, None)
    }

    /// Build every call and forward them to each transport as one batch.
    pub fn log_batch(&self, calls: Vec<Vec<Arg>>) -> Result<Vec<Payload>, LogError> {
        self.check_open()?;
        let mut payloads = Vec::with_capacity(calls.len());
        let mut callbacks = Vec::new();
        for call in calls {
            let (record, callback) = args::normalize(&self.inner.levels, call);
            let payload = self.build(record, &self.inner.label);
            if let Some(callback) = callback {
                callbacks.push((payloads.len(), callback));
            }
            payloads.push(payload);
        }
        if self.is_muted() {
            return Ok(payloads);
        }

        self.dispatch_batch(payloads.clone())?;
        for (index, callback) in callbacks {
            callback(&payloads[index]);
        }
        Ok(payloads)
    }

    /// Start a timer on the first call for `id`; the second call logs an
    /// `info` payload with the elapsed `duration` in milliseconds. `meta`
    /// is merged last and may override any of those keys.
    pub fn profile(&self, id: &str, meta: Option<Map<String, Value>>) -> Result<Option<Payload>, LogError> {
        let now = Instant::now();
        let started = {
            let mut profiles = unpoison(self.inner.profiles.lock());
            match profiles.remove(id) {
                Some(started) => started,
                None => {
                    profiles.insert(id.to_string(), now);
                    return Ok(None);
                }
            }
        };

        let mut record = Map::new();
        record.insert("level".into(), Value::from("info"));
        record.insert("message".into(), Value::from(id));
        record.insert(
            "duration".into(),
            Value::from(now.duration_since(started).as_millis() as u64),
        );
        if let Some(meta) = meta {
            record.extend(meta);
        }
        self.log(vec![Arg::Value(Value::Object(record))]).map(Some)
    }

    // CHILDREN & MUTING //

    /// Create a child that merges `meta` into every payload.
    pub fn child(&self, label: impl Into<String>, meta: Map<String, Value>) -> Result<ChildLogger, ConfigError> {
        let label = label.into();
        let mut children = unpoison(self.inner.children.lock());
        if children.contains_key(&label) {
            return Err(ConfigError::DuplicateChild { label });
        }
        let state = Arc::new(ChildState::new(label.clone(), meta));
        children.insert(label, state.clone());
        Ok(ChildLogger::new(self.clone(), state))
    }

    pub fn get_child(&self, label: &str) -> Option<ChildLogger> {
        unpoison(self.inner.children.lock())
            .get(label)
            .map(|state| ChildLogger::new(self.clone(), state.clone()))
    }

    pub fn children(&self) -> Vec<String> {
        unpoison(self.inner.children.lock()).keys().cloned().collect()
    }

    pub(crate) fn forget_child(&self, label: &str) {
        unpoison(self.inner.children.lock()).remove(label);
    }

    pub fn mute(&self, scope: MuteScope) {
        self.set_muted(scope, true);
    }

    pub fn unmute(&self, scope: MuteScope) {
        self.set_muted(scope, false);
    }

    fn set_muted(&self, scope: MuteScope, muted: bool) {
        let children = unpoison(self.inner.children.lock());
        match scope {
            MuteScope::Logger => self.inner.muted.store(muted, Ordering::SeqCst),
            MuteScope::AllChildren => children.values().for_each(|c| c.set_muted(muted)),
            MuteScope::Children(labels) => children
                .iter()
                .filter(|(label, _)| labels.contains(label))
                .for_each(|(_, c)| c.set_muted(muted)),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    // QUERY & FIREHOSE //

    /// Query the named transports, or all of them when `labels` is empty.
    /// Transports without query support are counted as skipped.
    pub async fn query(&self, options: QueryOptions, labels: &[&str]) -> Query {
        let sources = self
            .select(labels)
            .iter()
            .map(|t| (t.label().to_string(), t.query(&options)))
            .collect();
        let mut query = Query::new(options);
        query.exec(sources).await;
        query
    }

    /// Merge the live feeds of the named transports, or all of them when
    /// `labels` is empty. Must be called from within a Tokio runtime.
    pub fn firehose(&self, labels: &[&str]) -> Firehose {
        let feeds = self
            .select(labels)
            .iter()
            .filter_map(|t| t.firehose().map(|feed| (t.label().to_string(), feed)))
            .collect();
        Firehose::merge(feeds)
    }

    // CLOSING //

    /// End every open transport concurrently and wait for each to reach a
    /// terminal state, then report closed. Further log calls fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let open: Vec<Transport> = self
            .transports()
            .into_iter()
            .filter(|t| !t.state().is_terminal())
            .collect();

        join_all(open.into_iter().map(|transport| async move {
            let ending = transport.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || ending.end()).await {
                tracing::warn!(transport = %transport.label(), error = %err, "transport end task failed");
            }
            transport.wait_terminal().await
        }))
        .await;

        tracing::debug!(logger = %self.inner.label, "logger closed");
        self.publish(LoggerEvent::Closed {
            logger: self.inner.label.clone(),
        });
    }

    /// Close, disarm both handlers, drop every child and detach every
    /// transport.
    pub async fn exit(&self) {
        self.unhandle(FatalKind::Exception);
        self.unhandle(FatalKind::Rejection);
        self.close().await;
        let children = std::mem::take(&mut *unpoison(self.inner.children.lock()));
        children.values().for_each(|child| child.mark_closed());
        let transports = std::mem::take(&mut *unpoison(self.inner.transports.lock()));
        for transport in transports {
            transport.detach();
        }
    }

    // FATAL ERRORS //

    pub fn handler_state(&self, kind: FatalKind) -> HandlerState {
        unpoison(self.inner.handlers.lock())
            .get(&kind)
            .map_or(HandlerState::Unarmed, |h| h.state)
    }

    /// Register the named transports for `kind` and arm its handler.
    pub fn handle(&self, kind: FatalKind, labels: &[&str]) {
        for transport in self.select(labels) {
            transport.set_handles(kind, true);
        }
        self.arm(kind);
    }

    /// Remove the process-level listener for `kind`. Tagged errors are no
    /// longer relayed.
    pub fn unhandle(&self, kind: FatalKind) {
        let mut handlers = unpoison(self.inner.handlers.lock());
        if let Some(handler) = handlers.remove(&kind) {
            if let Some(id) = handler.subscription {
                fatal::unsubscribe(id);
            }
        }
    }

    fn arm(&self, kind: FatalKind) {
        let mut handlers = unpoison(self.inner.handlers.lock());
        if handlers.contains_key(&kind) {
            return;
        }
        let weak: Weak<LoggerInner> = Arc::downgrade(&self.inner);
        let id = fatal::subscribe(
            kind,
            Arc::new(move |err: &ErrorInfo| {
                weak.upgrade()
                    .and_then(|inner| Logger { inner }.on_fatal(kind, err))
            }),
        );
        handlers.insert(
            kind,
            Handler {
                state: HandlerState::Armed,
                subscription: Some(id),
            },
        );
    }

    fn set_handler_state(&self, kind: FatalKind, state: HandlerState) {
        if let Some(handler) = unpoison(self.inner.handlers.lock()).get_mut(&kind) {
            handler.state = state;
        }
    }

    /// Log a process-fatal error and, when exiting on error, start the exit
    /// wait. Returns the exit thread when one was started.
    fn on_fatal(&self, kind: FatalKind, err: &ErrorInfo) -> Option<JoinHandle<()>> {
        {
            let mut handlers = unpoison(self.inner.handlers.lock());
            let handler = handlers.get_mut(&kind)?;
            if handler.state != HandlerState::Armed {
                return None;
            }
            handler.state = HandlerState::Dispatching;
        }

        let registered: Vec<Transport> = self
            .transports()
            .into_iter()
            .filter(|t| t.handles(kind))
            .collect();

        let mut exit = self.inner.error_exit.load(Ordering::SeqCst);
        if exit && registered.is_empty() {
            let message = format!("cannot exit on error with 0 {} transports, ignoring error exit", kind);
            tracing::warn!(logger = %self.inner.label, %kind, "{}", message);
            self.publish(LoggerEvent::Warn {
                source: self.inner.label.clone(),
                message,
            });
            exit = false;
        }

        let mut record = Source::new(self.inner.levels[0].clone(), err.message.clone());
        record.err = Some(err.clone().tagged(kind));
        if let Err(failure) = self.build_and_dispatch(record) {
            eprintln!("{}: failed to log {}: {}", self.inner.label, kind, failure);
        }

        if !exit {
            self.set_handler_state(kind, HandlerState::Armed);
            return None;
        }

        self.set_handler_state(kind, HandlerState::Exiting);
        tracing::info!(
            logger = %self.inner.label,
            transports = registered.len(),
            grace_ms = self.inner.exit_grace.as_millis() as u64,
            "exiting after {}", kind
        );
        Some(fatal::spawn_exit(
            registered,
            self.inner.exit_grace,
            self.inner.terminator.clone(),
        ))
    }

    fn build_and_dispatch(&self, record: Source) -> Result<(), LogError> {
        let payload = self.build(record, &self.inner.label);
        self.dispatch(&payload)
    }
}

/// Text of a direct write: strings as is, everything else displayed.
fn stringify(arg: Arg) -> String {
    match arg {
        Arg::Str(s) => s,
        Arg::Value(v) => display(&v),
        Arg::Error(e) => e.to_string(),
        Arg::Callback(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::fatal::ExitOutcome;
    use crate::transform::modifiers;
    use crate::transport::{MemorySink, TransportState};
    use serde_json::json;
    use serial_test::serial;
    use std::sync::Mutex as StdMutex;

    fn memory_logger(label: &str) -> (Logger, MemorySink) {
        let sink = MemorySink::new();
        let logger = Logger::new(
            label,
            LoggerOptions {
                transports: vec![Transport::new("mem", sink.clone())],
                ..Default::default()
            },
        )
        .unwrap();
        (logger, sink)
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<ExitOutcome>>);

    impl Terminator for Recorder {
        fn terminate(&self, outcome: ExitOutcome) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    #[test]
    fn test_empty_levels_rejected() {
        let err = Logger::new(
            "bad",
            LoggerOptions {
                levels: Some(vec![]),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::EmptyLevels { label: "bad".into() });
    }

    #[test]
    fn test_custom_levels_get_empty_colors() {
        let logger = Logger::new(
            "custom",
            LoggerOptions {
                levels: Some(vec!["loud".into(), "quiet".into()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(logger.colors().is_empty());
        assert_eq!(Logger::new("std", LoggerOptions::default()).unwrap().colors().len(), 6);
    }

    #[test]
    fn test_log_fans_out_in_order() {
        let (a, b) = (MemorySink::new(), MemorySink::new());
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![Transport::new("a", a.clone()), Transport::new("b", b.clone())],
                ..Default::default()
            },
        )
        .unwrap();

        logger.info("one").unwrap();
        logger.warn("two").unwrap();
        logger.log(args!["three"]).unwrap();

        assert_eq!(a.messages(), vec!["one", "two", "three"]);
        assert_eq!(b.messages(), a.messages());
        assert_eq!(a.payloads()[2].level, "log");
    }

    #[test]
    fn test_payload_config() {
        let (logger, sink) = memory_logger("app");
        logger.info("first").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        logger.info("second").unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads[0].config().label, "app");
        assert_eq!(payloads[0].config().elapsed_ms, 0);
        assert!(payloads[1].config().elapsed_ms >= 5);
        assert_eq!(payloads[0].config().transport.as_deref(), Some("mem"));
    }

    #[test]
    fn test_callback_receives_payload() {
        let (logger, _) = memory_logger("app");
        let seen = Arc::new(StdMutex::new(None));
        let captured = seen.clone();
        logger
            .log(vec![
                Arg::from("info"),
                Arg::from("done"),
                Arg::callback(move |p: &Payload| *captured.lock().unwrap() = Some(p.message.clone())),
            ])
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("done"));
    }

    #[test]
    fn test_zero_transports_warns_once() {
        let logger = Logger::new("lonely", LoggerOptions::default()).unwrap();
        let mut events = logger.subscribe();
        logger.info("a").unwrap();
        logger.info("b").unwrap();
        assert!(matches!(events.try_recv(), Ok(LoggerEvent::Warn { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_transport_label() {
        let (logger, _) = memory_logger("app");
        let err = logger
            .add_transport(Transport::new("mem", MemorySink::new()))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTransport { label: "mem".into() });
    }

    #[test]
    fn test_remove_transport_closes_it() {
        let (logger, sink) = memory_logger("app");
        let removed = logger.remove_transport("mem").unwrap();
        assert_eq!(removed.state(), TransportState::Closed);
        assert!(removed.owner().is_none());
        assert!(sink.is_closed());
        assert!(logger.transport("mem").is_none());
    }

    #[test]
    fn test_logger_transforms_are_fallback() {
        let sink = MemorySink::new();
        let own = MemorySink::new();
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transforms: vec![modifiers::label().unit().into()],
                transports: vec![
                    Transport::new("plain", sink.clone()),
                    Transport::builder("own")
                        .transforms([modifiers::pad().unit()])
                        .sink(own.clone())
                        .build()
                        .unwrap(),
                ],
                ..Default::default()
            },
        )
        .unwrap();
        logger.info("hi").unwrap();
        assert_eq!(sink.payloads()[0].get("label"), Some(&json!("app:")));
        assert!(own.payloads()[0].get("label").is_none());
    }

    #[test]
    fn test_muted_logger_dispatches_nothing() {
        let (logger, sink) = memory_logger("app");
        logger.mute(MuteScope::Logger);
        logger.info("hidden").unwrap();
        logger.unmute(MuteScope::Logger);
        logger.info("shown").unwrap();
        assert_eq!(sink.messages(), vec!["shown"]);
    }

    #[test]
    fn test_write_and_write_ln() {
        let (logger, sink) = memory_logger("app");
        logger.write("raw").unwrap();
        logger.write_ln(json!({"a": 1})).unwrap();
        assert_eq!(sink.outputs(), vec!["raw", "{\"a\":1}\n"]);
        assert_eq!(sink.payloads()[1].level, "writeLn");
    }

    #[test]
    fn test_log_batch_uses_batch_path() {
        let sink = MemorySink::new().with_batches();
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![Transport::new("mem", sink.clone())],
                ..Default::default()
            },
        )
        .unwrap();
        let payloads = logger
            .log_batch(vec![args!["info", "a"], args!["warn", "b"]])
            .unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(sink.messages(), vec!["a", "b"]);
        assert_eq!(sink.batch_calls(), 1);
    }

    #[test]
    fn test_profile() {
        let (logger, sink) = memory_logger("app");
        assert!(logger.profile("load", None).unwrap().is_none());
        std::thread::sleep(Duration::from_millis(3));
        let mut meta = Map::new();
        meta.insert("rows".into(), json!(12));
        let payload = logger.profile("load", Some(meta)).unwrap().unwrap();

        assert_eq!(payload.level, "info");
        assert_eq!(payload.message, "load");
        assert!(payload.get("duration").and_then(Value::as_u64).unwrap() >= 3);
        assert_eq!(payload.get("rows"), Some(&json!(12)));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_transport_errors_reemitted() {
        let (logger, sink) = memory_logger("app");
        let mut events = logger.subscribe();
        sink.fail_writes(true);
        logger.info("x").unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(LoggerEvent::Error { transport, .. }) if transport == "mem"
        ));
    }

    #[tokio::test]
    async fn test_close_waits_for_transports() {
        let (logger, sink) = memory_logger("app");
        let transport = logger.transport("mem").unwrap();
        let mut events = logger.subscribe();
        logger.close().await;

        assert_eq!(transport.state(), TransportState::Finished);
        assert!(sink.is_closed());
        assert_eq!(
            events.recv().await.unwrap(),
            LoggerEvent::Closed { logger: "app".into() }
        );
        assert_eq!(
            logger.info("late").unwrap_err(),
            LogError::Closed { label: "app".into() }
        );
    }

    #[tokio::test]
    async fn test_query_counts_skipped() {
        let sink = MemorySink::new();
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![
                    Transport::new("mem", sink.clone()),
                    Transport::new("console", crate::transport::ConsoleSink::new(std::io::sink(), std::io::sink())),
                ],
                ..Default::default()
            },
        )
        .unwrap();
        logger
            .log(args!["info", "stamped", json!({"timestamp": chrono::Utc::now().to_rfc3339()})])
            .unwrap();

        let query = logger.query(QueryOptions::default(), &[]).await;
        let report = query.report();
        assert_eq!(report.queried, vec!["mem".to_string()]);
        assert_eq!(report.skipped, vec!["console".to_string()]);
        assert_eq!(report.rows.len(), 1);
    }

    #[test]
    #[serial]
    fn test_rejection_relayed_without_exit() {
        let (plain, handled) = (MemorySink::new(), MemorySink::new());
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![
                    Transport::new("plain", plain.clone()),
                    Transport::builder("handled")
                        .rejections(true)
                        .sink(handled.clone())
                        .build()
                        .unwrap(),
                ],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(logger.handler_state(FatalKind::Rejection), HandlerState::Armed);

        fatal::report_rejection(ErrorInfo::new("task failed"));

        assert_eq!(plain.messages(), vec!["task failed"]);
        assert_eq!(handled.messages(), vec!["task failed"]);
        let err = handled.payloads()[0].err().cloned().unwrap();
        assert!(err.is_tagged(FatalKind::Rejection));
        assert_eq!(handled.payloads()[0].level, "fatal");
        assert_eq!(logger.handler_state(FatalKind::Rejection), HandlerState::Armed);

        logger.unhandle(FatalKind::Rejection);
        fatal::report_rejection(ErrorInfo::new("ignored"));
        assert_eq!(plain.len(), 1);
    }

    #[test]
    #[serial]
    fn test_error_exit_without_transports_downgrades() {
        let recorder = Arc::new(Recorder::default());
        let sink = MemorySink::new();
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![Transport::new("mem", sink.clone())],
                error_exit: true,
                terminator: recorder.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        logger.handle(FatalKind::Rejection, &["missing"]);
        let mut events = logger.subscribe();

        fatal::report_rejection(ErrorInfo::new("boom"));

        assert!(matches!(events.try_recv(), Ok(LoggerEvent::Warn { .. })));
        assert_eq!(sink.messages(), vec!["boom"]);
        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(logger.handler_state(FatalKind::Rejection), HandlerState::Armed);
        logger.unhandle(FatalKind::Rejection);
    }

    #[test]
    #[serial]
    fn test_error_exit_waits_for_registered_transports() {
        let recorder = Arc::new(Recorder::default());
        let sink = MemorySink::new();
        let logger = Logger::new(
            "app",
            LoggerOptions {
                transports: vec![Transport::new("mem", sink.clone())],
                error_exit: true,
                terminator: recorder.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        logger.handle(FatalKind::Rejection, &["mem"]);

        let handle = logger.on_fatal(FatalKind::Rejection, &ErrorInfo::new("boom")).unwrap();
        handle.join().unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![ExitOutcome::AllFinished]);
        assert_eq!(logger.handler_state(FatalKind::Rejection), HandlerState::Exiting);
        assert_eq!(logger.transport("mem").unwrap().state(), TransportState::Finished);
        assert_eq!(sink.len(), 1);
        logger.unhandle(FatalKind::Rejection);
    }
}

//! Transports: filtered, transformed, single-writer sinks
//!
//! A [`Transport`] wraps a concrete [`Sink`]. Every write goes through the
//! same gate: level and mute filtering, routing of tagged fatal errors,
//! the compiled transform stack and finally the sink. The sink sits behind
//! a mutex, so each transport sees payloads in arrival order and a write
//! returns only after the sink has acknowledged it.

pub mod console;
pub mod file;
pub mod memory;

pub use console::ConsoleSink;
pub use file::{FileSink, FileSinkOptions, Frequency};
pub use memory::MemorySink;

use crate::error::{unpoison, ConfigError, LogError, SinkError};
use crate::firehose::SinkFeed;
use crate::logger::LoggerEvent;
use crate::payload::{is_direct_write, is_unleveled, FatalKind, Payload};
use crate::query::{QueryOptions, QuerySource};
use crate::transform::{combine, Transform, TransformStack};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread runs a transform stack or a sink call
/// under `catch_unwind`. Such panics are reported on the transport instead
/// of as process-fatal exceptions; the sink lock is still held there.
pub(crate) fn in_guarded() -> bool {
    GUARDED.with(Cell::get)
}

/// A concrete output.
pub trait Sink: Send {
    fn log(&mut self, payload: &Payload) -> Result<(), SinkError>;

    fn supports_batch(&self) -> bool {
        false
    }

    /// Write several payloads in one call. Only used when
    /// [`Sink::supports_batch`] is true.
    fn log_batch(&mut self, payloads: &[Payload]) -> Result<(), SinkError> {
        for payload in payloads {
            self.log(payload)?;
        }
        Ok(())
    }

    /// Historical rows, `None` when the sink cannot be queried.
    fn query(&mut self, _options: &QueryOptions) -> Option<QuerySource> {
        None
    }

    /// Live rows, `None` when the sink cannot stream.
    fn firehose(&mut self) -> Option<SinkFeed> {
        None
    }

    /// Flush and release resources.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Most verbose level accepted, all levels when unset.
    pub level: Option<String>,
    pub exceptions: bool,
    pub rejections: bool,
    pub transforms: Vec<Transform>,
    /// Run the transform stack; when false the raw message is written.
    pub transform: bool,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self {
            transform: true,
            ..Default::default()
        }
    }

    pub fn handles(&self, kind: FatalKind) -> bool {
        match kind {
            FatalKind::Exception => self.exceptions,
            FatalKind::Rejection => self.rejections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Finished,
    Errored,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        self != TransportState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Logged { transport: String, level: String },
    Error { transport: String, message: String },
    Warn { transport: String, message: String },
    Finished { transport: String },
    Closed { transport: String },
}

struct Owner {
    label: String,
    levels: Arc<[String]>,
    events: broadcast::Sender<LoggerEvent>,
}

struct TransportInner {
    label: String,
    options: Mutex<TransportOptions>,
    stack: Mutex<Option<TransformStack>>,
    muted: AtomicBool,
    sink: Mutex<Box<dyn Sink>>,
    owner: Mutex<Option<Owner>>,
    events: broadcast::Sender<TransportEvent>,
    state: watch::Sender<TransportState>,
}

/// Shared handle to a transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Builds a [`Transport`].
///
/// ```ignore
/// let transport = Transport::builder("console")
///     .level("warn")
///     .sink(ConsoleSink::stdout())
///     .build()?;
/// ```
pub struct TransportBuilder {
    label: String,
    options: TransportOptions,
    sink: Option<Box<dyn Sink>>,
}

impl TransportBuilder {
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.options.level = Some(level.into());
        self
    }

    pub fn exceptions(mut self, enabled: bool) -> Self {
        self.options.exceptions = enabled;
        self
    }

    pub fn rejections(mut self, enabled: bool) -> Self {
        self.options.rejections = enabled;
        self
    }

    pub fn transforms<I, T>(mut self, transforms: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Transform>,
    {
        self.options
            .transforms
            .extend(transforms.into_iter().map(Into::into));
        self
    }

    pub fn transform(mut self, enabled: bool) -> Self {
        self.options.transform = enabled;
        self
    }

    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn boxed_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Transport, ConfigError> {
        let sink = self.sink.ok_or_else(|| ConfigError::MissingSink {
            label: self.label.clone(),
        })?;
        Ok(Transport::from_parts(self.label, self.options, sink))
    }
}

impl Transport {
    pub fn builder(label: impl Into<String>) -> TransportBuilder {
        TransportBuilder {
            label: label.into(),
            options: TransportOptions::new(),
            sink: None,
        }
    }

    /// Transport with default options around `sink`.
    pub fn new(label: impl Into<String>, sink: impl Sink + 'static) -> Self {
        Self::from_parts(label.into(), TransportOptions::new(), Box::new(sink))
    }

    fn from_parts(label: String, options: TransportOptions, sink: Box<dyn Sink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(TransportState::Open);
        Self {
            inner: Arc::new(TransportInner {
                label,
                options: Mutex::new(options),
                stack: Mutex::new(None),
                muted: AtomicBool::new(false),
                sink: Mutex::new(sink),
                owner: Mutex::new(None),
                events,
                state,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn options(&self) -> TransportOptions {
        unpoison(self.inner.options.lock()).clone()
    }

    pub fn level(&self) -> Option<String> {
        unpoison(self.inner.options.lock()).level.clone()
    }

    /// Change the level. Levels unknown to the owning logger are ignored
    /// with a warning.
    pub fn set_level(&self, level: impl Into<String>) {
        let level = level.into();
        let known = {
            let owner = unpoison(self.inner.owner.lock());
            owner
                .as_ref()
                .map_or(true, |o| o.levels.iter().any(|l| *l == level))
        };
        if !known {
            self.warn(format!("level \"{}\" is not a known level, ignoring", level));
            return;
        }
        unpoison(self.inner.options.lock()).level = Some(level);
    }

    pub fn handles(&self, kind: FatalKind) -> bool {
        unpoison(self.inner.options.lock()).handles(kind)
    }

    pub(crate) fn set_handles(&self, kind: FatalKind, enabled: bool) {
        let mut options = unpoison(self.inner.options.lock());
        match kind {
            FatalKind::Exception => options.exceptions = enabled,
            FatalKind::Rejection => options.rejections = enabled,
        }
    }

    pub fn mute(&self) {
        self.inner.muted.store(true, Ordering::SeqCst);
    }

    pub fn unmute(&self) {
        self.inner.muted.store(false, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Label of the owning logger.
    pub fn owner(&self) -> Option<String> {
        unpoison(self.inner.owner.lock())
            .as_ref()
            .map(|o| o.label.clone())
    }

    /// Append units and recompile the stack.
    pub fn transform<I, T>(&self, transforms: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<Transform>,
    {
        let own = {
            let mut options = unpoison(self.inner.options.lock());
            options
                .transforms
                .extend(transforms.into_iter().map(Into::into));
            combine(options.transforms.clone())
        };
        *unpoison(self.inner.stack.lock()) = Some(own);
    }

    /// The compiled stack, compiling from the transport's own units when
    /// nothing has compiled it yet.
    pub fn stack(&self) -> TransformStack {
        let mut stack = unpoison(self.inner.stack.lock());
        if let Some(compiled) = stack.as_ref() {
            return compiled.clone();
        }
        let compiled = combine(unpoison(self.inner.options.lock()).transforms.clone());
        *stack = Some(compiled.clone());
        compiled
    }

    /// Bind to a logger. The stack compiles here, falling back to the
    /// logger's units when the transport declares none.
    pub(crate) fn attach(
        &self,
        owner: &str,
        levels: Arc<[String]>,
        fallback: &TransformStack,
        events: broadcast::Sender<LoggerEvent>,
    ) -> Result<(), ConfigError> {
        let mut slot = unpoison(self.inner.owner.lock());
        if let Some(existing) = slot.as_ref() {
            return Err(ConfigError::TransportAttached {
                label: self.inner.label.clone(),
                owner: existing.label.clone(),
            });
        }

        let own = unpoison(self.inner.options.lock()).transforms.clone();
        let compiled = if own.is_empty() {
            fallback.clone()
        } else {
            combine(own)
        };
        *unpoison(self.inner.stack.lock()) = Some(compiled);

        *slot = Some(Owner {
            label: owner.to_string(),
            levels,
            events,
        });
        Ok(())
    }

    /// Unbind from the owner, close the sink and signal `Closed`.
    pub(crate) fn detach(&self) {
        unpoison(self.inner.owner.lock()).take();
        self.close();
    }

    /// Whether this transport takes `payload` on the normal write path.
    pub fn accept(&self, payload: &Payload) -> bool {
        if self.is_muted() {
            return false;
        }
        let options = unpoison(self.inner.options.lock());

        if let Some(err) = payload.err() {
            if let Some(kind) = err.kind {
                if options.handles(kind) {
                    return false;
                }
            }
        }

        let level = &payload.source().level;
        if is_unleveled(level) {
            return true;
        }
        let Some(max) = options.level.as_deref() else {
            return true;
        };
        let levels = &payload.config().levels;
        match (
            levels.iter().position(|l| l == max),
            levels.iter().position(|l| l == level),
        ) {
            (Some(max), Some(idx)) => idx <= max,
            _ => true,
        }
    }

    /// Filter and transform one payload. `Ok(None)` means the payload was
    /// acknowledged without output.
    fn prepare(&self, mut payload: Payload) -> Result<Option<Payload>, LogError> {
        if !self.accept(&payload) {
            return Ok(None);
        }
        payload.set_transport(&self.inner.label);

        if is_direct_write(&payload.source().level) {
            let raw = payload.message.clone();
            payload.set_output(raw);
            return Ok(Some(payload));
        }

        let transform = unpoison(self.inner.options.lock()).transform;
        let stack = if transform {
            self.stack()
        } else {
            TransformStack::default()
        };

        let result = run_guarded(|| stack.apply(payload)).map_err(|message| {
            LogError::TransformPanicked {
                transport: self.inner.label.clone(),
                message,
            }
        })?;

        if !result.is_ok() {
            tracing::trace!(
                transport = %self.inner.label,
                errors = ?result.errors,
                "payload dropped by transform"
            );
            return Ok(None);
        }
        Ok(Some(result.payload))
    }

    /// Write one payload and wait for the sink.
    ///
    /// Sink failures are reported on the event channels and do not fail
    /// the write. A panicking transform unit does.
    pub fn write(&self, payload: Payload) -> Result<(), LogError> {
        let mut sink = unpoison(self.inner.sink.lock());
        if self.state().is_terminal() {
            return Ok(());
        }
        let Some(payload) = self.prepare(payload)? else {
            return Ok(());
        };
        let result = guard_sink(|| sink.log(&payload));
        drop(sink);
        self.after_log(&payload.level, result);
        Ok(())
    }

    /// Write payloads in arrival order, as one sink call when the sink
    /// supports batches.
    pub fn write_batch(&self, payloads: Vec<Payload>) -> Result<(), LogError> {
        let mut sink = unpoison(self.inner.sink.lock());
        if self.state().is_terminal() {
            return Ok(());
        }

        if !sink.supports_batch() {
            for payload in payloads {
                let Some(payload) = self.prepare(payload)? else {
                    continue;
                };
                let result = guard_sink(|| sink.log(&payload));
                self.after_log(&payload.level, result);
            }
            return Ok(());
        }

        let mut ready = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if let Some(payload) = self.prepare(payload)? {
                ready.push(payload);
            }
        }
        if ready.is_empty() {
            return Ok(());
        }
        match guard_sink(|| sink.log_batch(&ready)) {
            Ok(()) => {
                for payload in &ready {
                    self.emit(TransportEvent::Logged {
                        transport: self.inner.label.clone(),
                        level: payload.level.clone(),
                    });
                }
            }
            Err(err) => self.sink_failed(err),
        }
        Ok(())
    }

    /// Deliver a tagged fatal error outside the normal filters. Never
    /// fails; problems go straight to stderr.
    pub(crate) fn relay(&self, mut payload: Payload) {
        payload.set_transport(&self.inner.label);
        let stack = self.stack();
        let result = match run_guarded(|| stack.apply(payload)) {
            Ok(result) => result,
            Err(message) => {
                eprintln!("{}: transform panicked while relaying: {}", self.inner.label, message);
                return;
            }
        };
        let mut sink = unpoison(self.inner.sink.lock());
        if let Err(err) = guard_sink(|| sink.log(&result.payload)) {
            eprintln!("{}: failed to relay fatal error: {}", self.inner.label, err);
        }
    }

    pub fn query(&self, options: &QueryOptions) -> Option<QuerySource> {
        let mut sink = unpoison(self.inner.sink.lock());
        run_guarded(|| sink.query(options)).unwrap_or_else(|message| {
            tracing::warn!(transport = %self.inner.label, %message, "sink panicked opening a query");
            None
        })
    }

    pub fn firehose(&self) -> Option<SinkFeed> {
        let mut sink = unpoison(self.inner.sink.lock());
        run_guarded(|| sink.firehose()).unwrap_or_else(|message| {
            tracing::warn!(transport = %self.inner.label, %message, "sink panicked opening a firehose");
            None
        })
    }

    /// Flush and close the sink, then signal `Finished` or `Errored`.
    pub fn end(&self) -> TransportState {
        let mut sink = unpoison(self.inner.sink.lock());
        if self.state().is_terminal() {
            return self.state();
        }
        let state = match guard_sink(|| sink.close()) {
            Ok(()) => TransportState::Finished,
            Err(err) => {
                self.sink_failed(err);
                TransportState::Errored
            }
        };
        drop(sink);
        self.inner.state.send_replace(state);
        if state == TransportState::Finished {
            self.emit(TransportEvent::Finished {
                transport: self.inner.label.clone(),
            });
        }
        state
    }

    /// Close the sink and signal `Closed`.
    pub fn close(&self) {
        let mut sink = unpoison(self.inner.sink.lock());
        if self.state().is_terminal() {
            return;
        }
        if let Err(err) = guard_sink(|| sink.close()) {
            self.sink_failed(err);
        }
        drop(sink);
        self.inner.state.send_replace(TransportState::Closed);
        self.emit(TransportEvent::Closed {
            transport: self.inner.label.clone(),
        });
    }

    /// Resolve once the transport reaches a terminal state.
    pub async fn wait_terminal(&self) -> TransportState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    fn after_log(&self, level: &str, result: Result<(), SinkError>) {
        match result {
            Ok(()) => self.emit(TransportEvent::Logged {
                transport: self.inner.label.clone(),
                level: level.to_string(),
            }),
            Err(err) => self.sink_failed(err),
        }
    }

    fn sink_failed(&self, err: SinkError) {
        tracing::warn!(transport = %self.inner.label, error = %err, "sink write failed");
        let message = err.to_string();
        self.emit(TransportEvent::Error {
            transport: self.inner.label.clone(),
            message: message.clone(),
        });
        self.forward(LoggerEvent::Error {
            transport: self.inner.label.clone(),
            message,
        });
    }

    fn warn(&self, message: String) {
        tracing::warn!(transport = %self.inner.label, "{}", message);
        self.emit(TransportEvent::Warn {
            transport: self.inner.label.clone(),
            message: message.clone(),
        });
        self.forward(LoggerEvent::Warn {
            source: self.inner.label.clone(),
            message,
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.inner.events.send(event);
    }

    fn forward(&self, event: LoggerEvent) {
        if let Some(owner) = unpoison(self.inner.owner.lock()).as_ref() {
            let _ = owner.events.send(event);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Run `f`, turning a panic into its message.
fn run_guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    let outer = GUARDED.with(|flag| flag.replace(true));
    let result = catch_unwind(AssertUnwindSafe(f));
    GUARDED.with(|flag| flag.set(outer));
    result.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    })
}

/// A panicking sink becomes a [`SinkError::Panicked`] failure.
fn guard_sink(f: impl FnOnce() -> Result<(), SinkError>) -> Result<(), SinkError> {
    run_guarded(f).unwrap_or_else(|message| Err(SinkError::Panicked(message)))
}

//! Child loggers

use super::{args, Arg, Log, Logger, LoggerEvent};
use crate::error::LogError;
use crate::payload::Payload;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-child state kept in the parent's registry.
#[derive(Debug)]
pub(crate) struct ChildState {
    label: String,
    meta: Map<String, Value>,
    muted: AtomicBool,
    closed: AtomicBool,
}

impl ChildState {
    pub(crate) fn new(label: String, meta: Map<String, Value>) -> Self {
        Self {
            label,
            meta,
            muted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A logger that delegates everything to its parent except the write
/// path, where its fixed metadata is merged into each record.
#[derive(Clone)]
pub struct ChildLogger {
    parent: Logger,
    state: Arc<ChildState>,
}

impl std::fmt::Debug for ChildLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildLogger")
            .field("label", &self.state.label)
            .field("parent", &self.parent.label())
            .field("meta", &self.state.meta)
            .finish()
    }
}

impl ChildLogger {
    pub(crate) fn new(parent: Logger, state: Arc<ChildState>) -> Self {
        Self { parent, state }
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.state.meta
    }

    pub fn parent(&self) -> &Logger {
        &self.parent
    }

    pub fn mute(&self) {
        self.state.set_muted(true);
    }

    pub fn unmute(&self) {
        self.state.set_muted(false);
    }

    /// Muted on its own or through its parent.
    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::SeqCst) || self.parent.is_muted()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst) || self.parent.is_closed()
    }

    pub fn write(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.check_open()?;
        self.parent.write(message)
    }

    pub fn write_ln(&self, message: impl Into<Arg>) -> Result<Payload, LogError> {
        self.check_open()?;
        self.parent.write_ln(message)
    }

    /// Remove the child from its parent and report it closed. The parent's
    /// transports stay open.
    pub async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.parent.forget_child(&self.state.label);
        self.parent.publish(LoggerEvent::Closed {
            logger: self.state.label.clone(),
        });
    }

    fn check_open(&self) -> Result<(), LogError> {
        if self.is_closed() {
            return Err(LogError::Closed {
                label: self.state.label.clone(),
            });
        }
        Ok(())
    }
}

impl Log for ChildLogger {
    fn log(&self, args: Vec<Arg>) -> Result<Payload, LogError> {
        self.check_open()?;
        let (mut record, callback) = args::normalize(&self.parent.inner.levels, args);
        for (key, value) in &self.state.meta {
            record.fields.insert(key.clone(), value.clone());
        }
        if self.is_muted() {
            return Ok(Payload::new(
                record,
                self.parent.dispatch_config(&self.state.label, 0),
            ));
        }
        self.parent.emit(record, &self.state.label, callback)
    }
}

//! In-memory sink
//!
//! Captures written payloads behind a shared handle. Clones observe the same
//! buffer, so a test or benchmark can keep one clone and hand the other to a
//! transport.

use super::Sink;
use crate::error::{unpoison, SinkError};
use crate::payload::Payload;
use crate::query::{QueryOptions, QuerySource};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Shared {
    payloads: Mutex<Vec<Payload>>,
    batch_calls: AtomicUsize,
    closed: AtomicBool,
    fail: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemorySink {
    shared: Arc<Shared>,
    batches: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept whole batches in one call.
    #[must_use]
    pub fn with_batches(mut self) -> Self {
        self.batches = true;
        self
    }

    /// Make every following write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail.store(fail, Ordering::SeqCst);
    }

    pub fn payloads(&self) -> Vec<Payload> {
        unpoison(self.shared.payloads.lock()).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        unpoison(self.shared.payloads.lock())
            .iter()
            .map(|p| p.message.clone())
            .collect()
    }

    /// Rendered output of every payload.
    pub fn outputs(&self) -> Vec<String> {
        unpoison(self.shared.payloads.lock())
            .iter()
            .map(|p| p.output().unwrap_or_default().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        unpoison(self.shared.payloads.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_calls(&self) -> usize {
        self.shared.batch_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        unpoison(self.shared.payloads.lock()).clear();
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.shared.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Io(io::Error::other("memory sink write failure")));
        }
        Ok(())
    }
}

impl Sink for MemorySink {
    fn log(&mut self, payload: &Payload) -> Result<(), SinkError> {
        self.check()?;
        unpoison(self.shared.payloads.lock()).push(payload.clone());
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.batches
    }

    fn log_batch(&mut self, payloads: &[Payload]) -> Result<(), SinkError> {
        self.check()?;
        self.shared.batch_calls.fetch_add(1, Ordering::SeqCst);
        unpoison(self.shared.payloads.lock()).extend_from_slice(payloads);
        Ok(())
    }

    /// Rows are the rendered outputs parsed as JSON, falling back to the
    /// payload object.
    fn query(&mut self, _options: &QueryOptions) -> Option<QuerySource> {
        let rows = unpoison(self.shared.payloads.lock())
            .iter()
            .map(|p| {
                p.output()
                    .and_then(|out| serde_json::from_str::<Value>(out).ok())
                    .filter(Value::is_object)
                    .unwrap_or_else(|| p.to_value())
            })
            .collect();
        Some(QuerySource::Rows(rows))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

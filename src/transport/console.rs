//! Console sink

use super::Sink;
use crate::error::SinkError;
use crate::payload::{is_direct_write, Payload};
use std::io::{self, Write};

/// Writes rendered output to a byte sink, routing `error_levels` to a
/// separate error writer.
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    error_levels: Vec<String>,
    eol: String,
}

impl ConsoleSink {
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            err: Box::new(err),
            error_levels: Vec::new(),
            eol: "\n".to_string(),
        }
    }

    /// stdout, with stderr as the error writer.
    pub fn stdout() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    #[must_use]
    pub fn with_error_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_levels = levels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_eol(mut self, eol: impl Into<String>) -> Self {
        self.eol = eol.into();
        self
    }
}

impl Sink for ConsoleSink {
    fn log(&mut self, payload: &Payload) -> Result<(), SinkError> {
        let level = &payload.source().level;
        let writer = if self.error_levels.iter().any(|l| l == level) {
            &mut self.err
        } else {
            &mut self.out
        };

        let output = payload.output().unwrap_or(payload.message.as_str());
        writer.write_all(output.as_bytes())?;
        if !is_direct_write(level) {
            writer.write_all(self.eol.as_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        self.err.flush()?;
        Ok(())
    }
}

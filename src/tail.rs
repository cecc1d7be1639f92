//! Live tailing of a growing file
//!
//! A tail polls one 64KB block at a byte cursor, decodes it with a
//! streaming UTF-8 decoder and splits complete lines on a configurable
//! pattern. The trailing fragment waits for the next read; an empty read
//! flushes it as a final line and sleeps for the poll interval. Bytes of a
//! partly written character survive the flush.

use crate::error::TailError;
use regex::Regex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
const CHANNEL_CAPACITY: usize = 1024;

/// Decodes UTF-8 across arbitrary byte boundaries.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much as possible; an incomplete trailing sequence is kept
    /// for the next call. Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this slice is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Drain whatever is buffered, replacing an incomplete sequence.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Reassembles lines from arbitrary reads.
#[derive(Debug)]
pub struct LineSplitter {
    decoder: Utf8Decoder,
    fragment: String,
    eol: Regex,
    skip: usize,
    row: usize,
}

impl LineSplitter {
    /// `skip` leading lines are counted but not emitted.
    pub fn new(eol: Regex, skip: usize) -> Self {
        Self {
            decoder: Utf8Decoder::default(),
            fragment: String::new(),
            eol,
            skip,
            row: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.fragment.push_str(&self.decoder.decode(bytes));
        let text = std::mem::take(&mut self.fragment);

        let mut pieces: Vec<&str> = self.eol.split(&text).collect();
        let fragment = pieces.pop().unwrap_or_default().to_string();

        let mut lines = Vec::new();
        for piece in pieces {
            if let Some(line) = self.emit(piece) {
                lines.push(line);
            }
        }
        self.fragment = fragment;
        lines
    }

    /// Emit the pending fragment as a complete line. Bytes of a
    /// character still being written stay in the decoder.
    pub fn flush(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.fragment);
        self.emit(&text)
    }

    /// End of input: emit the fragment together with any undecodable
    /// trailing bytes.
    pub fn finish(&mut self) -> Option<String> {
        let mut text = std::mem::take(&mut self.fragment);
        text.push_str(&self.decoder.finish());
        self.emit(&text)
    }

    fn emit(&mut self, piece: &str) -> Option<String> {
        if piece.is_empty() {
            return None;
        }
        let row = self.row;
        self.row += 1;
        (row >= self.skip).then(|| piece.to_string())
    }

    /// Lines seen so far, skipped ones included.
    pub fn rows(&self) -> usize {
        self.row
    }
}

/// Where a new tail starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    /// From the beginning, dropping the first `n` lines.
    Skip(usize),
    /// From the current end of the file.
    End,
    /// From the start of the last `n` lines.
    Last(usize),
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    pub start: TailStart,
    pub interval: Duration,
    pub eol: Regex,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            start: TailStart::End,
            interval: DEFAULT_INTERVAL,
            eol: default_eol(),
        }
    }
}

fn default_eol() -> Regex {
    match Regex::new(r"\n+") {
        Ok(re) => re,
        Err(_) => unreachable!("static pattern"),
    }
}

#[derive(Debug)]
pub enum TailEvent {
    Line(String),
    /// The tail ended because of this error.
    Error(TailError),
}

/// A running tail. Dropping the handle destroys the tail.
#[derive(Debug)]
pub struct TailHandle {
    events: mpsc::Receiver<TailEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailHandle {
    /// Next line or terminal error; `None` once the tail has ended.
    pub async fn next(&mut self) -> Option<TailEvent> {
        self.events.recv().await
    }

    /// Stop polling and close the file. Not restartable.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the poll task to release the file.
    pub async fn closed(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start tailing `path`. Must be called from within a Tokio runtime.
pub fn tail(path: impl AsRef<Path>, options: TailOptions) -> TailHandle {
    let path = path.as_ref().to_path_buf();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poll_loop(path, options, tx, cancel.clone()));
    TailHandle {
        events: rx,
        cancel,
        task,
    }
}

async fn poll_loop(
    path: PathBuf,
    options: TailOptions,
    tx: mpsc::Sender<TailEvent>,
    cancel: CancellationToken,
) {
    let path_display = path.display().to_string();
    let opened = tokio::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(&path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(source) => {
            tracing::debug!(path = %path_display, error = %source, "tail open failed");
            let _ = tx.send(TailEvent::Error(TailError::Open { path: path_display, source })).await;
            return;
        }
    };

    let (mut cursor, skip) = match start_position(&path, &file, options.start).await {
        Ok(start) => start,
        Err(source) => {
            let _ = tx.send(TailEvent::Error(TailError::Read { path: path_display, source })).await;
            return;
        }
    };

    let mut splitter = LineSplitter::new(options.eol.clone(), skip);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_at(&mut file, cursor, &mut buf) => read,
        };

        match read {
            Err(source) => {
                tracing::debug!(path = %path_display, error = %source, "tail read failed");
                if let Some(line) = splitter.finish() {
                    let _ = tx.send(TailEvent::Line(line)).await;
                }
                let _ = tx.send(TailEvent::Error(TailError::Read { path: path_display, source })).await;
                break;
            }
            Ok(0) => {
                if let Some(line) = splitter.flush() {
                    if tx.send(TailEvent::Line(line)).await.is_err() {
                        break;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.interval) => {}
                }
            }
            Ok(n) => {
                cursor += n as u64;
                for line in splitter.push(&buf[..n]) {
                    if cancel.is_cancelled() || tx.send(TailEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn read_at(file: &mut tokio::fs::File, cursor: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(cursor)).await?;
    file.read(buf).await
}

async fn start_position(
    path: &Path,
    file: &tokio::fs::File,
    start: TailStart,
) -> io::Result<(u64, usize)> {
    match start {
        TailStart::Skip(n) => Ok((0, n)),
        TailStart::End => Ok((file.metadata().await?.len(), 0)),
        TailStart::Last(n) => {
            let path = path.to_path_buf();
            let offset = tokio::task::spawn_blocking(move || offset_of_last_lines(&path, n))
                .await
                .map_err(io::Error::other)??;
            Ok((offset, 0))
        }
    }
}

/// Byte offset where the last `n` complete lines of `path` begin.
///
/// Reads backwards in 64KB chunks so the cost follows `n`, not the file
/// size. A trailing unterminated fragment counts as a line.
pub fn offset_of_last_lines(path: &Path, n: usize) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    if n == 0 {
        return Ok(file_size);
    }

    let mut offset = file_size;
    let mut seen = 0;
    // a final newline terminates the last line rather than starting one
    let mut skip_first_newline = true;
    let mut chunk = vec![0u8; CHUNK_SIZE];

    while offset > 0 {
        let read_size = (CHUNK_SIZE as u64).min(offset);
        offset -= read_size;
        file.seek(SeekFrom::Start(offset))?;
        let chunk = &mut chunk[..read_size as usize];
        file.read_exact(chunk)?;

        for i in (0..chunk.len()).rev() {
            if chunk[i] != b'\n' {
                skip_first_newline = false;
                continue;
            }
            if skip_first_newline {
                skip_first_newline = false;
                continue;
            }
            seen += 1;
            if seen == n {
                return Ok(offset + i as u64 + 1);
            }
        }
    }

    Ok(0)
}

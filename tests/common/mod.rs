//! Common test utilities and helpers

use logfan::transform::stacks::{self, FileStackOptions};
use logfan::{
    ExitOutcome, FileSink, FileSinkOptions, Logger, LoggerOptions, MemorySink, Terminator,
    Transport,
};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// File sink options in a fresh temporary directory, without rotation by size
#[allow(dead_code)]
pub fn file_options(dir: &Path) -> FileSinkOptions {
    FileSinkOptions {
        size: None,
        max_logs: None,
        ..FileSinkOptions::new(dir)
    }
}

/// Logger with a JSON file transport and an in-memory transport
#[allow(dead_code)]
pub fn create_test_file_logger(label: &str) -> (Logger, MemorySink, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let memory = MemorySink::new();
    let file = Transport::builder("file")
        .sink(FileSink::new(file_options(temp_dir.path())).expect("Failed to create FileSink"))
        .transforms([stacks::file(&FileStackOptions::default())])
        .build()
        .expect("Failed to build file transport");

    let logger = Logger::new(
        label,
        LoggerOptions {
            transports: vec![file, Transport::new("memory", memory.clone())],
            ..Default::default()
        },
    )
    .expect("Failed to create Logger");
    (logger, memory, temp_dir)
}

/// Write `num_entries` JSON rows, one second apart ending now, alternating
/// `error` and `info`
#[allow(dead_code)]
pub fn create_log_with_entries(dir: &Path, num_entries: usize) -> PathBuf {
    let log_path = dir.join("entries.log");
    let mut file = BufWriter::new(File::create(&log_path).expect("Failed to create log file"));

    let now = chrono::Utc::now();
    for i in 0..num_entries {
        let at = now - chrono::Duration::seconds((num_entries - i) as i64);
        let row = json!({
            "level": if i % 3 == 0 { "error" } else { "info" },
            "message": format!("message {}", i),
            "seq": i,
            "timestamp": at.to_rfc3339(),
        });
        serde_json::to_writer(&mut file, &row).expect("Failed to write entry");
        writeln!(file).expect("Failed to write newline");
    }

    file.flush().expect("Failed to flush file");
    log_path
}

/// Every line of a JSON-lines file, checking the expected count
#[allow(dead_code)]
pub fn verify_jsonl_file(path: &Path, expected_entries: usize) -> Vec<Value> {
    assert!(path.exists(), "Log file does not exist: {:?}", path);

    let content = fs::read_to_string(path).expect("Failed to read log file");
    let rows: Vec<Value> = content
        .lines()
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("Failed to parse entry {} as JSON: {}\nLine: {}", i, e, line))
        })
        .collect();

    assert_eq!(
        rows.len(),
        expected_entries,
        "Expected {} entries, found {}",
        expected_entries,
        rows.len()
    );
    rows
}

/// The only log file in `dir`, ignoring the audit sidecar
#[allow(dead_code)]
pub fn single_log_file(dir: &Path) -> PathBuf {
    let files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("Failed to read log dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == "log"))
        .collect();
    assert_eq!(files.len(), 1, "Expected one log file, found {:?}", files);
    files[0].clone()
}

/// Terminator that records outcomes instead of exiting
#[derive(Default)]
pub struct RecordingTerminator {
    outcomes: Mutex<Vec<ExitOutcome>>,
}

#[allow(dead_code)]
impl RecordingTerminator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcomes(&self) -> Vec<ExitOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, outcome: ExitOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

/// Helper to measure execution time
#[allow(dead_code)]
pub fn measure_time<F, R>(f: F) -> (R, std::time::Duration)
where
    F: FnOnce() -> R,
{
    let start = std::time::Instant::now();
    let result = f();
    let duration = start.elapsed();
    (result, duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_log_with_entries() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = create_log_with_entries(temp_dir.path(), 10);
        let rows = verify_jsonl_file(&log_path, 10);
        assert_eq!(rows[0]["level"], "error");
        assert_eq!(rows[9]["seq"], 9);
    }
}

//! Common utilities for benchmarks

use logfan::{Logger, LoggerOptions, MemorySink, Transport};
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn create_bench_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Logger fanning out to `fan_out` in-memory transports
pub fn create_memory_logger(fan_out: usize) -> (Logger, Vec<MemorySink>) {
    let sinks: Vec<MemorySink> = (0..fan_out).map(|_| MemorySink::new()).collect();
    let transports = sinks
        .iter()
        .enumerate()
        .map(|(i, sink)| Transport::new(format!("memory-{}", i), sink.clone()))
        .collect();
    let logger = Logger::new(
        "bench",
        LoggerOptions {
            transports,
            ..Default::default()
        },
    )
    .expect("Failed to create logger");
    (logger, sinks)
}

/// JSON-lines file with `num_entries` rows, one second apart ending now
pub fn create_log_file_with_entries(dir: &Path, num_entries: usize) -> PathBuf {
    let log_path = dir.join("bench.log");
    let mut file = BufWriter::new(File::create(&log_path).expect("Failed to create log file"));

    let now = chrono::Utc::now();
    for i in 0..num_entries {
        let at = now - chrono::Duration::seconds((num_entries - i) as i64);
        let row = json!({
            "level": if i % 3 == 0 { "error" } else { "info" },
            "message": format!("Test message number {} with some additional text to make it realistic", i),
            "timestamp": at.to_rfc3339(),
        });
        serde_json::to_writer(&mut file, &row).expect("Failed to write entry");
        writeln!(file).expect("Failed to write newline");
    }

    file.flush().expect("Failed to flush file");
    log_path
}

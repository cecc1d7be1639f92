//! Rotating file sink
//!
//! Writes one rendered payload per line into a file named from a pattern
//! containing `%DATE%`. Files rotate when the date key changes or when the
//! active file reaches the size threshold. Every file the sink creates is
//! recorded in a JSON audit sidecar that also drives retention.

use super::Sink;
use crate::error::{ConfigError, SinkError};
use crate::firehose::SinkFeed;
use crate::payload::Payload;
use crate::query::{QueryOptions, QuerySource};
use crate::tail::{TailOptions, TailStart};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const DATE_TOKEN: &str = "%DATE%";
const DEFAULT_AUDIT_FILE: &str = ".audit.json";

/// How often the date key, and so the file name, changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Minute,
    Hourly,
    #[default]
    Daily,
    /// Key taken from `date_format` alone.
    Custom,
    /// Per-second keys, for exercising rotation.
    Test,
}

impl Frequency {
    fn date_format(self) -> &'static str {
        match self {
            Frequency::Minute => "%Y-%m-%dT%H-%M",
            Frequency::Hourly => "%Y-%m-%dT%H",
            Frequency::Daily | Frequency::Custom => "%Y-%m-%d",
            Frequency::Test => "%Y-%m-%dT%H-%M-%S",
        }
    }
}

impl FromStr for Frequency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "m" => Ok(Frequency::Minute),
            "hourly" | "h" => Ok(Frequency::Hourly),
            "daily" | "d" => Ok(Frequency::Daily),
            "custom" => Ok(Frequency::Custom),
            "test" => Ok(Frequency::Test),
            other => Err(ConfigError::InvalidValue {
                what: "frequency",
                value: other.to_string(),
            }),
        }
    }
}

/// Parse a size threshold such as `"10k"`, `"5m"` or `"1g"` into bytes.
/// A bare number is bytes.
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        what: "size",
        value: value.to_string(),
    };
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, unit) = match trimmed.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&trimmed[..i], Some(c)),
        Some(_) => (trimmed.as_str(), None),
        None => return Err(invalid()),
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        None | Some('b') => 1,
        Some('k') => 1024,
        Some('m') => 1024 * 1024,
        Some('g') => 1024 * 1024 * 1024,
        Some(_) => return Err(invalid()),
    };
    if n == 0 {
        return Err(invalid());
    }
    Ok(n * multiplier)
}

/// How many rotated files to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Days(u32),
    Count(usize),
}

impl FromStr for Retention {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            what: "max_logs",
            value: s.to_string(),
        };
        let trimmed = s.trim().to_ascii_lowercase();
        let parsed = match trimmed.strip_suffix('d') {
            Some(days) => days.parse().map(Retention::Days),
            None => trimmed.parse().map(Retention::Count),
        };
        match parsed.map_err(|_| invalid())? {
            Retention::Days(0) | Retention::Count(0) => Err(invalid()),
            ok => Ok(ok),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSinkOptions {
    pub dir: PathBuf,
    /// File name pattern, `%DATE%` is replaced by the date key.
    pub filename: String,
    pub frequency: Frequency,
    /// strftime pattern overriding the frequency's key format.
    pub date_format: Option<String>,
    /// Rotate once the active file reaches this size, e.g. `"5m"`.
    pub size: Option<String>,
    /// Keep files for this many days (`"7d"`) or this many files (`"10"`).
    pub max_logs: Option<String>,
    /// Audit sidecar, relative to `dir` unless absolute.
    pub audit_file: Option<PathBuf>,
    /// Gzip rotated files.
    pub archive: bool,
}

impl FileSinkOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            filename: format!("{}.log", DATE_TOKEN),
            frequency: Frequency::Daily,
            date_format: None,
            size: Some("5m".to_string()),
            max_logs: Some("7d".to_string()),
            audit_file: None,
            archive: false,
        }
    }
}

type RotateHook = Arc<dyn Fn(&Path, &Path) + Send + Sync>;
type NewHook = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub path: PathBuf,
    pub created: DateTime<Utc>,
}

/// Files created by the sink, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub files: Vec<AuditEntry>,
}

impl AuditLog {
    fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &Path) -> Result<(), SinkError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

pub struct FileSink {
    options: FileSinkOptions,
    size_limit: Option<u64>,
    retention: Option<Retention>,
    audit_path: PathBuf,
    audit: AuditLog,
    key: Option<String>,
    index: u32,
    active: Option<PathBuf>,
    on_rotate: Option<RotateHook>,
    on_new: Option<NewHook>,
}

impl fmt::Debug for FileSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSink")
            .field("options", &self.options)
            .field("active", &self.active)
            .finish()
    }
}

impl FileSink {
    /// Validate options and create the log directory.
    pub fn new(options: FileSinkOptions) -> Result<Self, SinkError> {
        let size_limit = options
            .size
            .as_deref()
            .map(parse_size)
            .transpose()?;
        let retention = options
            .max_logs
            .as_deref()
            .map(Retention::from_str)
            .transpose()?;

        if !options.dir.exists() {
            fs::create_dir_all(&options.dir)?;
        }

        let audit_path = match &options.audit_file {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => options.dir.join(p),
            None => options.dir.join(DEFAULT_AUDIT_FILE),
        };
        let audit = AuditLog::load(&audit_path);

        Ok(Self {
            options,
            size_limit,
            retention,
            audit_path,
            audit,
            key: None,
            index: 0,
            active: None,
            on_rotate: None,
            on_new: None,
        })
    }

    /// Called with `(old, new)` whenever the sink moves to another file.
    #[must_use]
    pub fn on_rotate(mut self, hook: impl Fn(&Path, &Path) + Send + Sync + 'static) -> Self {
        self.on_rotate = Some(Arc::new(hook));
        self
    }

    /// Called whenever the sink creates a file.
    #[must_use]
    pub fn on_new(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_new = Some(Arc::new(hook));
        self
    }

    pub fn options(&self) -> &FileSinkOptions {
        &self.options
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Path of the file the next write goes to.
    pub fn active_path(&self) -> PathBuf {
        match &self.active {
            Some(path) => path.clone(),
            None => self.path_for(&self.date_key(Utc::now()), self.index),
        }
    }

    fn date_key(&self, now: DateTime<Utc>) -> String {
        let format = self
            .options
            .date_format
            .as_deref()
            .unwrap_or(self.options.frequency.date_format());
        let mut key = String::new();
        if fmt::Write::write_fmt(&mut key, format_args!("{}", now.format(format))).is_err() {
            key = now.format(self.options.frequency.date_format()).to_string();
        }
        key
    }

    fn path_for(&self, key: &str, index: u32) -> PathBuf {
        let name = self.options.filename.replace(DATE_TOKEN, key);
        if index == 0 {
            return self.options.dir.join(name);
        }
        let path = Path::new(&name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(&name);
        let file = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}.{}", stem, index, ext),
            None => format!("{}.{}", stem, index),
        };
        self.options.dir.join(file)
    }

    fn is_full(&self, path: &Path) -> bool {
        match (self.size_limit, fs::metadata(path)) {
            (Some(limit), Ok(meta)) => meta.len() >= limit,
            _ => false,
        }
    }

    /// Pick the file for this write, rotating on a new date key or a full
    /// file.
    fn select_file(&mut self, now: DateTime<Utc>) -> Result<PathBuf, SinkError> {
        let key = self.date_key(now);
        if self.key.as_deref() != Some(key.as_str()) {
            self.key = Some(key.clone());
            self.index = 0;
        }
        let mut path = self.path_for(&key, self.index);
        while self.is_full(&path) {
            self.index += 1;
            path = self.path_for(&key, self.index);
        }

        if self.active.as_deref() != Some(path.as_path()) {
            let previous = self.active.replace(path.clone());
            if let Some(previous) = previous {
                self.rotated(&previous, &path);
            }
        }
        if !path.exists() {
            self.created(&path, now)?;
        }
        Ok(path)
    }

    fn rotated(&mut self, old: &Path, new: &Path) {
        tracing::info!(old_file = %old.display(), new_file = %new.display(), "log file rotated");
        if self.options.archive && old.exists() {
            match compress(old) {
                Ok(archived) => {
                    for entry in self.audit.files.iter_mut().filter(|e| e.path == old) {
                        entry.path = archived.clone();
                    }
                }
                Err(err) => tracing::warn!(file = %old.display(), error = %err, "archive failed"),
            }
        }
        if let Some(hook) = &self.on_rotate {
            hook(old, new);
        }
    }

    fn created(&mut self, path: &Path, now: DateTime<Utc>) -> Result<(), SinkError> {
        tracing::debug!(file = %path.display(), "log file created");
        self.audit.files.push(AuditEntry {
            path: path.to_path_buf(),
            created: now,
        });
        self.prune(now);
        self.audit.save(&self.audit_path)?;
        if let Some(hook) = &self.on_new {
            hook(path);
        }
        Ok(())
    }

    /// Drop audit entries past retention and delete their files. The
    /// active file is never removed.
    fn prune(&mut self, now: DateTime<Utc>) {
        let Some(retention) = self.retention else {
            return;
        };
        let active = self.active.clone();
        let expired: Vec<AuditEntry> = match retention {
            Retention::Count(keep) => {
                let excess = self.audit.files.len().saturating_sub(keep);
                self.audit.files.iter().take(excess).cloned().collect()
            }
            Retention::Days(days) => {
                let cutoff = now - ChronoDuration::days(i64::from(days));
                self.audit
                    .files
                    .iter()
                    .filter(|e| e.created < cutoff)
                    .cloned()
                    .collect()
            }
        };

        for entry in expired {
            if active.as_deref() == Some(entry.path.as_path()) {
                continue;
            }
            if let Err(err) = fs::remove_file(&entry.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(file = %entry.path.display(), error = %err, "failed to remove old log");
                    continue;
                }
            }
            self.audit.files.retain(|e| e.path != entry.path);
        }
    }

    /// Append one line under an exclusive lock.
    fn append(path: &Path, line: &str) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.lock_exclusive()?;
        let mut writer = BufWriter::with_capacity(8192, file);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn query_path(&self, options: &QueryOptions) -> PathBuf {
        match &options.filename {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.options.dir.join(p),
            None => self.active_path(),
        }
    }
}

/// Gzip `path` next to itself and remove the original.
fn compress(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    let compressed = PathBuf::from(name);

    let input = File::open(path)?;
    let output = File::create(&compressed)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(compressed)
}

impl Sink for FileSink {
    fn log(&mut self, payload: &Payload) -> Result<(), SinkError> {
        let path = self.select_file(Utc::now())?;
        let line = payload.output().unwrap_or(payload.message.as_str());
        Self::append(&path, line)?;
        Ok(())
    }

    /// Streams the active file, or `options.filename` when set.
    fn query(&mut self, options: &QueryOptions) -> Option<QuerySource> {
        let path = self.query_path(options);
        Some(QuerySource::Pending(Box::pin(async move {
            match tokio::fs::File::open(&path).await {
                Ok(file) => Ok(QuerySource::Stream(Box::new(file))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(QuerySource::Rows(Vec::new())),
                Err(err) => Err(err.into()),
            }
        })))
    }

    /// New lines appended to the active file, parsed as JSON. Needs a
    /// running Tokio runtime.
    fn firehose(&mut self) -> Option<SinkFeed> {
        tokio::runtime::Handle::try_current().ok()?;
        let options = TailOptions {
            start: TailStart::End,
            ..Default::default()
        };
        Some(SinkFeed::tail_json(&self.active_path(), options))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.audit.save(&self.audit_path)
    }
}

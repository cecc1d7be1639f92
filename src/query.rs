//! Historical row queries across transports
//!
//! Every participating transport hands back a [`QuerySource`]. Sources are
//! normalised into rows concurrently, each through a bounded window sized
//! by the query limit, and the per-source results are concatenated in
//! source order into one [`QueryReport`].

use crate::error::QueryError;
use crate::payload::{default_levels, DispatchConfig, Payload};
use crate::transform::TransformStack;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 64 * 1024;

/// Parses one raw line into a row.
pub type RowParser = Arc<dyn Fn(&str) -> Result<Value, QueryError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

#[derive(Clone)]
pub struct QueryOptions {
    pub timestamp_key: String,
    pub level: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum rows per source, 0 for unlimited.
    pub limit: usize,
    /// Raw leading lines to skip.
    pub start: usize,
    pub sort: SortOrder,
    pub parser: RowParser,
    /// Read this file instead of the transport's active one.
    pub filename: Option<PathBuf>,
    /// Stack used by [`Query::render`].
    pub transform: Option<TransformStack>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timestamp_key: "timestamp".to_string(),
            level: None,
            from: None,
            to: None,
            limit: 10,
            start: 0,
            sort: SortOrder::Desc,
            parser: Arc::new(parse_json_row),
            filename: None,
            transform: None,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("timestamp_key", &self.timestamp_key)
            .field("level", &self.level)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("limit", &self.limit)
            .field("start", &self.start)
            .field("sort", &self.sort)
            .field("filename", &self.filename)
            .finish()
    }
}

pub fn parse_json_row(line: &str) -> Result<Value, QueryError> {
    serde_json::from_str(line).map_err(|e| QueryError::Parse(e.to_string()))
}

/// Interpret a timestamp value: RFC 3339 strings, `%Y-%m-%d %H:%M:%S%.f`
/// and bare dates (taken as UTC), or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

/// What a transport's query path yields.
pub enum QuerySource {
    Rows(Vec<Value>),
    Lines(Vec<String>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// Resolves later to one of the other forms.
    Pending(BoxFuture<'static, Result<QuerySource, QueryError>>),
}

impl fmt::Debug for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySource::Rows(rows) => f.debug_tuple("Rows").field(&rows.len()).finish(),
            QuerySource::Lines(lines) => f.debug_tuple("Lines").field(&lines.len()).finish(),
            QuerySource::Stream(_) => f.write_str("Stream"),
            QuerySource::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Inclusive lower, exclusive upper time bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// `to` defaults to now and `from` to one day before `to`.
    pub fn resolve(options: &QueryOptions) -> Self {
        let to = options.to.unwrap_or_else(Utc::now);
        let from = options.from.unwrap_or(to - ChronoDuration::days(1));
        Self { from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Row predicate: timestamp present and in range, level matching when set.
pub fn is_valid(row: &Value, options: &QueryOptions, range: &TimeRange) -> bool {
    let Some(at) = row.get(&options.timestamp_key).and_then(parse_timestamp) else {
        return false;
    };
    if !range.contains(at) {
        return false;
    }
    match &options.level {
        Some(level) => row.get("level").and_then(Value::as_str) == Some(level.as_str()),
        None => true,
    }
}

/// Bounded top-N window.
struct RowWindow {
    rows: VecDeque<Value>,
    limit: usize,
    sort: SortOrder,
}

impl RowWindow {
    fn new(limit: usize, sort: SortOrder) -> Self {
        Self {
            rows: VecDeque::new(),
            limit,
            sort,
        }
    }

    fn is_full(&self) -> bool {
        self.limit > 0 && self.rows.len() >= self.limit
    }

    /// Returns false once no further rows can be accepted.
    fn offer(&mut self, row: Value) -> bool {
        match self.sort {
            SortOrder::Asc => {
                self.rows.push_back(row);
                !self.is_full()
            }
            SortOrder::Desc => {
                if self.is_full() {
                    self.rows.pop_back();
                }
                self.rows.push_front(row);
                true
            }
        }
    }

    fn finish(self) -> Vec<Value> {
        let mut rows: Vec<Value> = self.rows.into();
        if self.sort == SortOrder::Desc {
            rows.reverse();
        }
        rows
    }
}

/// Turns raw lines into validated rows inside a window.
struct LineFeed<'a> {
    options: &'a QueryOptions,
    range: TimeRange,
    window: RowWindow,
    seen: usize,
}

impl<'a> LineFeed<'a> {
    fn new(options: &'a QueryOptions, range: TimeRange) -> Self {
        Self {
            options,
            range,
            window: RowWindow::new(options.limit, options.sort),
            seen: 0,
        }
    }

    fn line(&mut self, line: &str) -> Result<bool, QueryError> {
        self.seen += 1;
        if self.seen <= self.options.start {
            return Ok(true);
        }
        let line = line.trim();
        if line.is_empty() {
            return Ok(true);
        }
        let row = (self.options.parser)(line)?;
        Ok(self.row(row))
    }

    fn row(&mut self, row: Value) -> bool {
        if is_valid(&row, self.options, &self.range) {
            self.window.offer(row)
        } else {
            true
        }
    }

    fn finish(self) -> Vec<Value> {
        self.window.finish()
    }
}

/// Read a line-oriented stream into rows. Returns as soon as an ascending
/// window fills; dropping the reader releases the source.
pub async fn normalize_stream<R>(
    mut reader: R,
    options: &QueryOptions,
    range: TimeRange,
) -> Result<Vec<Value>, QueryError>
where
    R: AsyncRead + Unpin,
{
    let mut feed = LineFeed::new(options, range);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        let mut consumed = 0;
        while let Some(pos) = pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let line = String::from_utf8_lossy(&pending[consumed..end]).into_owned();
            consumed = end + 1;
            if !feed.line(&line)? {
                return Ok(feed.finish());
            }
        }
        pending.drain(..consumed);
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        feed.line(&line)?;
    }
    Ok(feed.finish())
}

/// Normalise any source form into rows.
pub fn normalize(
    source: QuerySource,
    options: &QueryOptions,
    range: TimeRange,
) -> BoxFuture<'_, Result<Vec<Value>, QueryError>> {
    Box::pin(async move {
        match source {
            QuerySource::Rows(rows) => {
                let mut feed = LineFeed::new(options, range);
                for row in rows.into_iter().skip(options.start) {
                    if !feed.row(row) {
                        break;
                    }
                }
                Ok(feed.finish())
            }
            QuerySource::Lines(lines) => {
                let mut feed = LineFeed::new(options, range);
                for line in lines {
                    if !feed.line(&line)? {
                        break;
                    }
                }
                Ok(feed.finish())
            }
            QuerySource::Stream(reader) => normalize_stream(reader, options, range).await,
            QuerySource::Pending(fut) => normalize(fut.await?, options, range).await,
        }
    })
}

/// A source that failed during [`Query::exec`].
#[derive(Debug)]
pub struct SourceFailure {
    pub label: String,
    pub error: QueryError,
    /// Position of the source in the queried list.
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct QueryReport {
    pub queried: Vec<String>,
    pub success: Vec<String>,
    pub skipped: Vec<String>,
    pub rows: Vec<Value>,
    pub filtered: Vec<Value>,
    pub errors: Vec<SourceFailure>,
}

/// A query over one or more labelled sources.
pub struct Query {
    options: QueryOptions,
    report: QueryReport,
}

impl Query {
    pub fn new(options: QueryOptions) -> Self {
        Self {
            options,
            report: QueryReport::default(),
        }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn report(&self) -> &QueryReport {
        &self.report
    }

    pub fn into_report(self) -> QueryReport {
        self.report
    }

    /// Run every source concurrently and merge results in source order.
    /// `None` marks a source without query support.
    pub async fn exec(&mut self, sources: Vec<(String, Option<QuerySource>)>) -> &QueryReport {
        let range = TimeRange::resolve(&self.options);
        let options = &self.options;

        // failures report their position among all sources, skipped included
        let mut labels = Vec::new();
        let mut pending = Vec::new();
        for (index, (label, source)) in sources.into_iter().enumerate() {
            match source {
                Some(source) => {
                    labels.push((index, label));
                    pending.push(normalize(source, options, range));
                }
                None => self.report.skipped.push(label),
            }
        }

        let results = join_all(pending).await;
        for ((index, label), result) in labels.into_iter().zip(results) {
            self.report.queried.push(label.clone());
            match result {
                Ok(rows) => {
                    self.report.success.push(label);
                    self.report.rows.extend(rows);
                }
                Err(error) => {
                    tracing::debug!(source = %label, error = %error, "query source failed");
                    self.report.errors.push(SourceFailure { label, error, index });
                }
            }
        }
        &self.report
    }

    /// Expression filtering is not supported; the loaded rows are returned
    /// unchanged.
    pub fn filter(&mut self, _expressions: &[&str]) -> &[Value] {
        self.report.filtered = self.report.rows.clone();
        &self.report.filtered
    }

    /// Rows rendered through the query's stack, or as pretty JSON.
    pub fn render(&self) -> Vec<String> {
        let Some(stack) = &self.options.transform else {
            return self
                .report
                .rows
                .iter()
                .map(|row| serde_json::to_string_pretty(row).unwrap_or_else(|_| row.to_string()))
                .collect();
        };
        let levels: Arc<[String]> = default_levels().into();
        self.report
            .rows
            .iter()
            .filter_map(|row| {
                let payload = Payload::from_row(row, DispatchConfig::new("query", levels.clone()));
                let result = stack.apply(payload);
                result
                    .is_ok()
                    .then(|| result.payload.output().unwrap_or_default().to_string())
            })
            .collect()
    }

    pub fn show_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for line in self.render() {
            writeln!(out, "{}", line)?;
        }
        out.flush()
    }

    pub fn show(&self) -> std::io::Result<()> {
        self.show_to(&mut std::io::stdout().lock())
    }

    pub fn clear(&mut self) {
        self.report = QueryReport::default();
    }
}

//! logfan - structured logging from the command line
//!
//! ## Usage
//!
//! ### Log a message
//! ```bash
//! logfan log --level warn "disk almost full" --meta '{"pct": 91}'
//! # or one message per stdin line
//! some-command | logfan log --level info
//! ```
//!
//! ### Follow a log file
//! ```bash
//! logfan tail ~/.logfan/logs/2024-01-01.log --last 20
//! ```
//!
//! ### Query a log file
//! ```bash
//! logfan query ~/.logfan/logs/2024-01-01.log --limit 50 --sort asc --level error
//! ```
//!
//! Configuration is read from `--config <file>` when given, otherwise from
//! `LOGFAN_*` environment variables on top of the defaults.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logfan::query::parse_timestamp;
use logfan::{
    tail, Arg, Log, LogfanConfig, LoggerRegistry, Query, QueryOptions, QuerySource, SortOrder,
    TailEvent, TailStart,
};
use serde_json::Value;
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logfan")]
#[command(about = "logfan - leveled, multi-destination structured logging", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log a message, or each stdin line when no message is given
    Log {
        #[arg(short, long, default_value = "info")]
        level: String,
        /// JSON object merged into every payload
        #[arg(short, long)]
        meta: Option<String>,
        message: Vec<String>,
    },
    /// Print new lines of a file as they are written
    Tail {
        file: PathBuf,
        /// Start from the beginning, skipping this many lines
        #[arg(long, conflicts_with_all = ["end", "last"])]
        start: Option<usize>,
        /// Start at the current end of the file (default)
        #[arg(long)]
        end: bool,
        /// Start with the last N lines
        #[arg(long, conflicts_with = "end")]
        last: Option<usize>,
    },
    /// Print rows of a JSON-lines log file
    Query {
        file: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "desc")]
        sort: SortOrder,
        #[arg(long)]
        level: Option<String>,
        /// Earliest timestamp, inclusive
        #[arg(long)]
        from: Option<String>,
        /// Latest timestamp, exclusive
        #[arg(long)]
        to: Option<String>,
        /// Skip this many leading lines
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value = "timestamp")]
        timestamp_key: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr so they never mix with logged output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let mut config = LogfanConfig::from_file(path)?;
            config.apply_env();
            config
        }
        None => LogfanConfig::from_env(),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match cli.command {
                Commands::Log { level, meta, message } => run_log(&config, level, meta, message).await,
                Commands::Tail { file, start, end: _, last } => run_tail(&config, file, start, last).await,
                Commands::Query {
                    file,
                    limit,
                    sort,
                    level,
                    from,
                    to,
                    start,
                    timestamp_key,
                } => {
                    let options = QueryOptions {
                        timestamp_key,
                        level,
                        from: from.as_deref().map(parse_time).transpose()?,
                        to: to.as_deref().map(parse_time).transpose()?,
                        limit,
                        start,
                        sort,
                        ..QueryOptions::default()
                    };
                    run_query(file, options).await
                }
            }
        })
}

async fn run_log(config: &LogfanConfig, level: String, meta: Option<String>, message: Vec<String>) -> Result<()> {
    let registry = LoggerRegistry::new();
    let logger = registry.create_from_config(config)?;

    let meta = match meta {
        Some(raw) => {
            let value: Value = serde_json::from_str(&raw).context("--meta must be a JSON object")?;
            anyhow::ensure!(value.is_object(), "--meta must be a JSON object");
            Some(value)
        }
        None => None,
    };

    let call = |text: String| {
        let mut args = vec![Arg::from(level.as_str()), Arg::from(text)];
        if let Some(meta) = &meta {
            args.push(Arg::Value(meta.clone()));
        }
        args
    };

    if message.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = line.context("Failed to read stdin")?;
            logger.log(call(line))?;
        }
    } else {
        logger.log(call(message.join(" ")))?;
    }

    registry.close_all().await;
    Ok(())
}

async fn run_tail(config: &LogfanConfig, file: PathBuf, start: Option<usize>, last: Option<usize>) -> Result<()> {
    let mut options = config.tail_options();
    options.start = match (start, last) {
        (Some(skip), _) => TailStart::Skip(skip),
        (None, Some(n)) => TailStart::Last(n),
        (None, None) => TailStart::End,
    };

    let mut handle = tail(&file, options);
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = handle.next() => event,
        };
        match event {
            Some(TailEvent::Line(line)) => println!("{}", line),
            Some(TailEvent::Error(err)) => {
                handle.closed().await;
                return Err(err).context("Tail stopped");
            }
            None => break,
        }
    }
    handle.closed().await;
    Ok(())
}

async fn run_query(file: PathBuf, options: QueryOptions) -> Result<()> {
    let reader = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let label = file.display().to_string();

    let mut query = Query::new(options);
    let report = query
        .exec(vec![(label, Some(QuerySource::Stream(Box::new(reader))))])
        .await;
    if let Some(failure) = report.errors.first() {
        anyhow::bail!("Query failed for {}: {}", failure.label, failure.error);
    }
    query.show()?;
    Ok(())
}

fn parse_time(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(&Value::from(raw)).with_context(|| format!("Invalid timestamp: {}", raw))
}

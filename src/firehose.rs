//! Live row streams merged across transports

use crate::tail::{tail, TailEvent, TailOptions};
use futures::future::join_all;
use serde_json::Value;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 1024;

/// One item from a sink feed: a parsed row or an error message.
pub type FeedItem = Result<Value, String>;

/// A live row stream produced by a single sink.
#[derive(Debug)]
pub struct SinkFeed {
    pub events: mpsc::Receiver<FeedItem>,
    pub cancel: CancellationToken,
}

impl SinkFeed {
    pub fn new(capacity: usize) -> (mpsc::Sender<FeedItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                events: rx,
                cancel: CancellationToken::new(),
            },
        )
    }

    /// Tail `path` and parse each new line as a JSON row. Must be called
    /// from within a Tokio runtime.
    pub fn tail_json(path: &Path, options: TailOptions) -> Self {
        let (tx, feed) = Self::new(CHANNEL_CAPACITY);
        let mut handle = tail(path, options);
        let cancel = feed.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = handle.next() => event,
                };
                let item = match event {
                    Some(TailEvent::Line(line)) => {
                        serde_json::from_str::<Value>(&line).map_err(|e| e.to_string())
                    }
                    Some(TailEvent::Error(err)) => Err(err.to_string()),
                    None => break,
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            handle.closed().await;
        });

        feed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseEvent {
    Log { row: Value, transports: Vec<String> },
    Error { transport: String, message: String },
}

/// Merged live stream. Destroying it tears down every underlying feed.
#[derive(Debug)]
pub struct Firehose {
    events: mpsc::Receiver<FirehoseEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    transports: Vec<String>,
}

impl Firehose {
    /// Must be called from within a Tokio runtime.
    pub fn merge(feeds: Vec<(String, SinkFeed)>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let transports: Vec<String> = feeds.iter().map(|(label, _)| label.clone()).collect();

        let tasks = feeds
            .into_iter()
            .map(|(label, feed)| tokio::spawn(forward(label, feed, tx.clone(), cancel.clone())))
            .collect();

        Self {
            events: rx,
            cancel,
            tasks,
            transports,
        }
    }

    /// Labels of the transports feeding this stream.
    pub fn transports(&self) -> &[String] {
        &self.transports
    }

    /// Next event; `None` once every feed has ended.
    pub async fn next(&mut self) -> Option<FirehoseEvent> {
        self.events.recv().await
    }

    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Destroy and wait for every feed to shut down.
    pub async fn closed(mut self) {
        self.cancel.cancel();
        join_all(self.tasks.drain(..)).await;
    }
}

impl Drop for Firehose {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward(
    label: String,
    mut feed: SinkFeed,
    tx: mpsc::Sender<FirehoseEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = feed.events.recv() => item,
        };
        let event = match item {
            Some(Ok(row)) => FirehoseEvent::Log {
                row,
                transports: vec![label.clone()],
            },
            Some(Err(message)) => FirehoseEvent::Error {
                transport: label.clone(),
                message,
            },
            None => break,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    feed.cancel.cancel();
}

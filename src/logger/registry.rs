//! Keyed logger registry

use super::{Logger, LoggerOptions};
use crate::config::LogfanConfig;
use crate::error::{unpoison, ConfigError};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Loggers by label. Construct one at startup and pass it to whatever
/// needs to create or look up loggers.
#[derive(Debug, Default)]
pub struct LoggerRegistry {
    loggers: Mutex<BTreeMap<String, Logger>>,
}

impl LoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a logger. Fails if the label is taken.
    pub fn create(&self, label: &str, options: LoggerOptions) -> Result<Logger, ConfigError> {
        let mut loggers = unpoison(self.loggers.lock());
        if loggers.contains_key(label) {
            return Err(ConfigError::DuplicateLogger {
                label: label.to_string(),
            });
        }
        let logger = Logger::new(label, options)?;
        loggers.insert(label.to_string(), logger.clone());
        Ok(logger)
    }

    /// Create a logger, replacing any existing one under the same label.
    pub fn create_forced(&self, label: &str, options: LoggerOptions) -> Result<Logger, ConfigError> {
        let logger = Logger::new(label, options)?;
        if let Some(previous) = unpoison(self.loggers.lock()).insert(label.to_string(), logger.clone()) {
            tracing::debug!(logger = %previous.label(), "replaced registered logger");
        }
        Ok(logger)
    }

    /// Build a logger from configuration and register it under the
    /// configured label.
    pub fn create_from_config(&self, config: &LogfanConfig) -> anyhow::Result<Logger> {
        let options = config.logger_options()?;
        Ok(self.create(&config.label, options)?)
    }

    pub fn get(&self, label: &str) -> Option<Logger> {
        unpoison(self.loggers.lock()).get(label).cloned()
    }

    pub fn has(&self, label: &str) -> bool {
        unpoison(self.loggers.lock()).contains_key(label)
    }

    pub fn labels(&self) -> Vec<String> {
        unpoison(self.loggers.lock()).keys().cloned().collect()
    }

    /// Exit the logger, then drop it from the registry.
    pub async fn remove(&self, label: &str) -> Option<Logger> {
        let logger = self.get(label)?;
        logger.exit().await;
        unpoison(self.loggers.lock()).remove(label)
    }

    /// Exit every registered logger concurrently and clear the registry.
    pub async fn close_all(&self) {
        let loggers: Vec<Logger> = std::mem::take(&mut *unpoison(self.loggers.lock()))
            .into_values()
            .collect();
        futures::future::join_all(loggers.iter().map(|logger| logger.exit())).await;
    }
}

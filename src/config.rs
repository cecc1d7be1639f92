//! Logger configuration loaded from TOML and the environment

use crate::fatal::DEFAULT_EXIT_GRACE;
use crate::logger::LoggerOptions;
use crate::payload::default_levels;
use crate::tail::TailOptions;
use crate::transform::stacks::{self, FileStackOptions};
use crate::transport::{ConsoleSink, FileSink, FileSinkOptions, Frequency, Transport};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogfanConfig {
    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default = "default_levels")]
    pub levels: Vec<String>,

    /// Most verbose level written by every configured transport.
    #[serde(default)]
    pub level: Option<String>,

    #[serde(default)]
    pub error_exit: bool,

    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,

    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub tail: TailConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Levels written to stderr instead of stdout.
    #[serde(default = "default_error_levels")]
    pub error_levels: Vec<String>,

    #[serde(default = "default_eol")]
    pub eol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_filename")]
    pub filename: String,

    #[serde(default)]
    pub frequency: Frequency,

    #[serde(default)]
    pub date_format: Option<String>,

    #[serde(default = "default_size")]
    pub size: Option<String>,

    #[serde(default = "default_max_logs")]
    pub max_logs: Option<String>,

    #[serde(default)]
    pub audit_file: Option<PathBuf>,

    #[serde(default)]
    pub archive: bool,

    #[serde(default)]
    pub exceptions: bool,

    #[serde(default)]
    pub rejections: bool,

    #[serde(default)]
    pub stack: FileStackOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for LogfanConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            levels: default_levels(),
            level: None,
            error_exit: false,
            exit_grace_ms: default_exit_grace_ms(),
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
            tail: TailConfig::default(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_levels: default_error_levels(),
            eol: default_eol(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_log_dir(),
            filename: default_filename(),
            frequency: Frequency::default(),
            date_format: None,
            size: default_size(),
            max_logs: default_max_logs(),
            audit_file: None,
            archive: false,
            exceptions: false,
            rejections: false,
            stack: FileStackOptions::default(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl LogfanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {}", path.as_ref().display()))?;
        let config: LogfanConfig = toml::from_str(&contents)
            .context("Failed to parse configuration file")?;
        Ok(config)
    }

    /// Defaults overridden by `LOGFAN_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `LOGFAN_LABEL`, `LOGFAN_LEVEL`, `LOGFAN_DIR`
    /// and `LOGFAN_ERROR_EXIT`. Setting `LOGFAN_DIR` enables the file
    /// transport.
    pub fn apply_env(&mut self) {
        if let Ok(label) = std::env::var("LOGFAN_LABEL") {
            self.label = label;
        }

        if let Ok(level) = std::env::var("LOGFAN_LEVEL") {
            self.level = Some(level);
        }

        if let Ok(dir) = std::env::var("LOGFAN_DIR") {
            self.file.dir = PathBuf::from(dir);
            self.file.enabled = true;
        }

        if let Ok(exit) = std::env::var("LOGFAN_ERROR_EXIT") {
            if let Ok(enabled) = exit.parse() {
                self.error_exit = enabled;
            }
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), contents)
            .context("Failed to write configuration file")?;
        Ok(())
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            interval: Duration::from_millis(self.tail.interval_ms),
            ..TailOptions::default()
        }
    }

    pub fn file_sink_options(&self) -> FileSinkOptions {
        FileSinkOptions {
            dir: self.file.dir.clone(),
            filename: self.file.filename.clone(),
            frequency: self.file.frequency,
            date_format: self.file.date_format.clone(),
            size: self.file.size.clone(),
            max_logs: self.file.max_logs.clone(),
            audit_file: self.file.audit_file.clone(),
            archive: self.file.archive,
        }
    }

    /// Logger options with the configured console and file transports.
    pub fn logger_options(&self) -> Result<LoggerOptions> {
        let mut transports = Vec::new();

        if self.console.enabled {
            let sink = ConsoleSink::stdout()
                .with_error_levels(self.console.error_levels.iter().cloned())
                .with_eol(self.console.eol.clone());
            let mut builder = Transport::builder("console").sink(sink);
            if let Some(level) = &self.level {
                builder = builder.level(level.clone());
            }
            transports.push(builder.build()?);
        }

        if self.file.enabled {
            std::fs::create_dir_all(&self.file.dir)
                .with_context(|| format!("Failed to create log directory {}", self.file.dir.display()))?;
            let sink = FileSink::new(self.file_sink_options())
                .context("Failed to open file transport")?;
            let mut builder = Transport::builder("file")
                .sink(sink)
                .transforms([stacks::file(&self.file.stack)])
                .exceptions(self.file.exceptions)
                .rejections(self.file.rejections);
            if let Some(level) = &self.level {
                builder = builder.level(level.clone());
            }
            transports.push(builder.build()?);
        }

        Ok(LoggerOptions {
            levels: Some(self.levels.clone()),
            colors: None,
            transports,
            error_exit: self.error_exit,
            exit_grace: Duration::from_millis(self.exit_grace_ms),
            ..LoggerOptions::default()
        })
    }
}

fn default_label() -> String {
    "default".to_string()
}

fn default_exit_grace_ms() -> u64 {
    DEFAULT_EXIT_GRACE.as_millis() as u64
}

fn default_error_levels() -> Vec<String> {
    vec!["fatal".to_string(), "error".to_string()]
}

fn default_eol() -> String {
    "\n".to_string()
}

/// `$HOME/.logfan/logs`, falling back to the platform home directory
fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".logfan").join("logs")
}

fn default_filename() -> String {
    "%DATE%.log".to_string()
}

fn default_size() -> Option<String> {
    Some("5m".to_string())
}

fn default_max_logs() -> Option<String> {
    Some("7d".to_string())
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = LogfanConfig::default();
        assert_eq!(config.label, "default");
        assert_eq!(config.levels.len(), 6);
        assert_eq!(config.exit_grace_ms, 3000);
        assert!(config.console.enabled);
        assert!(!config.file.enabled);
        assert_eq!(config.file.filename, "%DATE%.log");
        assert_eq!(config.tail.interval_ms, 1000);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = LogfanConfig::default();
        config.file.frequency = Frequency::Hourly;
        config.level = Some("warn".to_string());
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = LogfanConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LogfanConfig = toml::from_str(
            r#"
            label = "api"

            [file]
            enabled = true
            frequency = "minute"
            "#,
        )
        .unwrap();
        assert_eq!(config.label, "api");
        assert_eq!(config.file.frequency, Frequency::Minute);
        assert_eq!(config.file.size.as_deref(), Some("5m"));
        assert!(config.console.enabled);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("LOGFAN_LABEL", "from-env");
        std::env::set_var("LOGFAN_DIR", "/tmp/logfan-env");
        std::env::set_var("LOGFAN_ERROR_EXIT", "true");
        let config = LogfanConfig::from_env();
        std::env::remove_var("LOGFAN_LABEL");
        std::env::remove_var("LOGFAN_DIR");
        std::env::remove_var("LOGFAN_ERROR_EXIT");

        assert_eq!(config.label, "from-env");
        assert_eq!(config.file.dir, PathBuf::from("/tmp/logfan-env"));
        assert!(config.file.enabled);
        assert!(config.error_exit);
    }

    #[test]
    #[serial]
    fn test_default_dir_respects_home() {
        let original = std::env::var("HOME").ok();
        std::env::set_var("HOME", "/tmp/logfan-home");
        let dir = default_log_dir();
        match original {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
        assert_eq!(dir, PathBuf::from("/tmp/logfan-home/.logfan/logs"));
    }

    #[test]
    fn test_logger_options_build_transports() {
        let dir = TempDir::new().unwrap();
        let mut config = LogfanConfig::default();
        config.console.enabled = false;
        config.file.enabled = true;
        config.file.dir = dir.path().join("logs");
        config.level = Some("info".to_string());

        let options = config.logger_options().unwrap();
        assert_eq!(options.transports.len(), 1);
        let file = &options.transports[0];
        assert_eq!(file.label(), "file");
        assert_eq!(file.level().as_deref(), Some("info"));
        assert!(dir.path().join("logs").is_dir());
    }
}

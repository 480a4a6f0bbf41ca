use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the logcandle service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Path of the persistent candle store. Default: "/tmp/logcandle.db".
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,

    /// Access-log source configuration. Absent = no ingestion (store and
    /// query paths still run).
    #[serde(default)]
    pub source: Option<SourceConfig>,

    /// Log-line parser configuration.
    #[serde(default)]
    pub parser: ParserConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Access-log source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Path of the access-log file to tail.
    pub path: PathBuf,

    /// Read the file from the beginning instead of the end. Default: false.
    #[serde(default)]
    pub from_start: bool,

    /// How often to poll for new data at EOF. Default: 500ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Log-line parser configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Log line regex with named capture groups (SourceIP, FileName,
    /// DestNode, Date and optionally AnswerTime).
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// chrono format of the Date capture group.
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health metrics server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_file() -> PathBuf {
    PathBuf::from("/tmp/logcandle.db")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_pattern() -> String {
    r"^(?P<Date>.+) - (?:.+) - (?P<FileName>.+) - (?P<SourceIP>.+) - (?:.+) - (?:.+) - https?://(?P<DestNode>.+?)/.+$".to_string()
}

fn default_date_format() -> String {
    "%Y/%m/%d %H:%M:%S".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            date_format: default_date_format(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.db_file.as_os_str().is_empty() {
            bail!("db_file is required");
        }

        if let Some(source) = &self.source {
            if source.path.as_os_str().is_empty() {
                bail!("source.path is required when a source is configured");
            }
            if source.poll_interval.is_zero() {
                bail!("source.poll_interval must be positive");
            }
        }

        if self.parser.pattern.is_empty() {
            bail!("parser.pattern is required");
        }
        if self.parser.date_format.is_empty() {
            bail!("parser.date_format is required");
        }

        Ok(())
    }
}

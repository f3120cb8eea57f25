//! Controller configuration, loaded from TOML.
//!
//! Default location: /etc/dflow/local-controller.toml. Every key is
//! optional; command-line flags override file values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dflow/local-controller.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Capacity of the worker's event channel
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Intents drained per consumer per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingConfig {
    #[serde(default = "default_aging_enabled")]
    pub enabled: bool,

    /// Grace period between establish and the stale-flow sweep
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConntrackConfig {
    #[serde(default = "default_conntrack_enabled")]
    pub enabled: bool,

    #[serde(default = "default_conntrack_command")]
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name of this host's chassis; ports bound here are local
    #[serde(default = "default_chassis")]
    pub chassis: String,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub aging: AgingConfig,

    #[serde(default)]
    pub conntrack: ConntrackConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_chassis() -> String {
    "localhost".to_string()
}

fn default_queue_depth() -> usize {
    1024
}

fn default_batch_size() -> usize {
    128
}

fn default_aging_enabled() -> bool {
    true
}

fn default_settle_delay_ms() -> u64 {
    5000
}

fn default_conntrack_enabled() -> bool {
    true
}

fn default_conntrack_command() -> String {
    "/usr/sbin/conntrack".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            enabled: default_aging_enabled(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            enabled: default_conntrack_enabled(),
            command: default_conntrack_command(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            chassis: default_chassis(),
            daemon: DaemonConfig::default(),
            aging: AgingConfig::default(),
            conntrack: ConntrackConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Loads `path`, falling back to defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content, &path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    pub fn from_toml(content: &str, origin: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.aging.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chassis.trim().is_empty() {
            return Err(ConfigError::Invalid("chassis must not be empty".to_string()));
        }
        if self.daemon.queue_depth == 0 {
            return Err(ConfigError::Invalid("daemon.queue_depth must be > 0".to_string()));
        }
        if self.daemon.batch_size == 0 {
            return Err(ConfigError::Invalid("daemon.batch_size must be > 0".to_string()));
        }
        if self.conntrack.enabled && self.conntrack.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "conntrack.command must be set when conntrack is enabled".to_string(),
            ));
        }
        if self.log.level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown log level {}", self.log.level)));
        }
        Ok(())
    }
}

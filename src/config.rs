//! Configuration module for ring-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "ring-echo")]
#[command(author = "ring-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A per-core sharded TCP echo server on io_uring", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port shared by every shard's listener (0 lets the kernel pick)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog per shard
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of shards (defaults to number of CPU cores)
    #[arg(short, long)]
    pub shards: Option<usize>,

    /// Submission/completion queue depth
    #[arg(long)]
    pub queue_depth: Option<u32>,

    /// Upper bound on a single completion wait, in milliseconds
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

    /// Descriptor ceiling; accepted descriptors at or above it are closed
    #[arg(long)]
    pub max_fds: Option<usize>,

    /// Largest single receive, in bytes
    #[arg(long)]
    pub max_message_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// 0 means one shard per available core
    #[serde(default)]
    pub shards: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            shards: 0,
        }
    }
}

/// io_uring configuration
#[derive(Debug, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// Per-shard capacity limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_fds")]
    pub max_fds: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_fds: default_max_fds(),
            max_message_len: default_max_message_len(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> u32 {
    1024
}

fn default_queue_depth() -> u32 {
    4096
}

fn default_wait_timeout_ms() -> u64 {
    100
}

fn default_max_fds() -> usize {
    65536
}

fn default_max_message_len() -> usize {
    2048
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub shards: usize,
    pub queue_depth: u32,
    pub wait_timeout_ms: u64,
    pub max_fds: usize,
    pub max_message_len: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            shards: cli.shards.unwrap_or(toml_config.server.shards),
            queue_depth: cli.queue_depth.unwrap_or(toml_config.ring.queue_depth),
            wait_timeout_ms: cli
                .wait_timeout_ms
                .unwrap_or(toml_config.ring.wait_timeout_ms),
            max_fds: cli.max_fds.unwrap_or(toml_config.limits.max_fds),
            max_message_len: cli
                .max_message_len
                .unwrap_or(toml_config.limits.max_message_len),
            // clap fills in "info" when the flag is absent, so let the file win then
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("queue_depth", self.queue_depth as u64),
            ("wait_timeout_ms", self.wait_timeout_ms),
            ("max_fds", self.max_fds as u64),
            ("max_message_len", self.max_message_len as u64),
            ("backlog", self.backlog as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if u32::try_from(self.max_message_len).is_err() {
            return Err(ConfigError::Invalid(
                "max_message_len must fit in 32 bits".to_string(),
            ));
        }

        // Descriptors are carried in the low half of the completion token
        if self.max_fds > i32::MAX as usize {
            return Err(ConfigError::Invalid("max_fds is too large".to_string()));
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Socket address every shard binds.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        addr.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("invalid listen address '{addr}': {e}"))
        })
    }

    /// Open-file ceiling requested from the OS: twice the slot capacity,
    /// leaving headroom for listeners and descriptors over the ceiling.
    pub fn fd_limit(&self) -> u64 {
        (self.max_fds as u64).saturating_mul(2)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

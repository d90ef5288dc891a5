//! Configuration module for aesdsocket.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "aesdsocket")]
#[command(version = "0.1.0")]
#[command(about = "Append newline-terminated packets to a shared log and echo it back", long_about = None)]
pub struct CliArgs {
    /// Detach from the terminal after the listening socket is ready
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<SocketAddr>,

    /// Path of the shared data file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
        }
    }
}

/// Shared log location
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
        }
    }
}

/// Per-connection settings
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Bytes requested per receive call
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

/// Timestamp writer settings
#[derive(Debug, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also send log events to syslog
    #[serde(default = "default_syslog")]
    pub syslog: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            syslog: default_syslog(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9000))
}

fn default_backlog() -> i32 {
    10
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_recv_buffer_size() -> usize {
    1024
}

fn default_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_syslog() -> bool {
    true
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub data_file: PathBuf,
    pub recv_buffer_size: usize,
    pub timestamp_interval: Duration,
    pub daemon: bool,
    pub log_level: String,
    pub syslog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        Self {
            daemon: false,
            config: None,
            listen: None,
            data_file: None,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Self::merge(cli, toml_config);
        config.validate()?;

        // Daemon mode changes directory to `/`, so pin relative paths now.
        if config.data_file.is_relative() {
            let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
            config.data_file = cwd.join(&config.data_file);
        }
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            data_file: cli.data_file.unwrap_or(toml_config.storage.data_file),
            recv_buffer_size: toml_config.connection.recv_buffer_size,
            timestamp_interval: Duration::from_secs(toml_config.timer.interval_secs),
            daemon: cli.daemon || toml_config.daemon,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            syslog: toml_config.logging.syslog,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("server.backlog must be positive"));
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "connection.recv_buffer_size must be non-zero",
            ));
        }
        if self.timestamp_interval.is_zero() {
            return Err(ConfigError::Invalid("timer.interval_secs must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
    WorkingDir(std::io::Error),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
            ConfigError::WorkingDir(e) => {
                write!(f, "Failed to resolve the working directory: {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

//! Configuration module for the echomux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Which sockets the event loop serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Both,
}

impl Transport {
    pub fn serves_tcp(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Both)
    }

    pub fn serves_udp(self) -> bool {
        matches!(self, Transport::Udp | Transport::Both)
    }
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echomux")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP/UDP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Transports to serve (tcp, udp, or both)
    #[arg(short = 't', long, value_enum)]
    pub transport: Option<Transport>,

    /// Maximum number of concurrent TCP connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Echo read buffer size in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Transports to serve
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// Listen backlog for the TCP socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            transport: default_transport(),
            backlog: default_backlog(),
        }
    }
}

/// Event-loop tuning configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of concurrent TCP connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Echo read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum readiness events consumed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_transport() -> Transport {
    Transport::Both
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_batch_size() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub transport: Transport,
    pub backlog: i32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub log_level: String,
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
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            transport: cli.transport.unwrap_or(toml_config.server.transport),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.runtime.max_connections),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.runtime.buffer_size),
            batch_size: toml_config.runtime.batch_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}

//! Configuration module for frame-echo.
//!
//! The server supports both command-line arguments and a TOML configuration
//! file. CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults. The client only takes an optional
//! host/port pair.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "frame-echo")]
#[command(version)]
#[command(about = "A length-prefixed echo server and its line-driven client", long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Send one request per input line to a running server
    Client(ClientArgs),
}

/// Server arguments
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Size of the connection table; descriptors at or above it are rejected
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Upper bound on a single readiness wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Largest request payload accepted, in bytes
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Readiness events handled per wait
    #[arg(long)]
    pub events_capacity: Option<usize>,
}

/// Client arguments
#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Server address [default: 127.0.0.1]
    #[arg(requires = "port")]
    pub host: Option<String>,

    /// Server port [default: 8000]
    #[arg(requires = "host")]
    pub port: Option<u16>,
}

impl ClientArgs {
    /// Host and port to connect to, falling back to the defaults.
    pub fn endpoint(&self) -> (String, u16) {
        (
            self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            self.port.unwrap_or(DEFAULT_PORT),
        )
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
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
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_payload() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub poll_timeout_ms: u64,
    pub events_capacity: usize,
    pub max_payload: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(&ServeArgs::default(), TomlConfig::default(), None)
    }
}

impl Config {
    /// Load configuration from server args and the TOML file they name.
    pub fn load(args: &ServeArgs, log_level: Option<String>) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(args, toml_config, log_level))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(args: &ServeArgs, toml_config: TomlConfig, log_level: Option<String>) -> Self {
        let server = toml_config.server;
        Config {
            host: args.host.clone().unwrap_or(server.host),
            port: args.port.unwrap_or(server.port),
            max_connections: args.max_connections.unwrap_or(server.max_connections),
            poll_timeout_ms: args.poll_timeout_ms.unwrap_or(server.poll_timeout_ms),
            events_capacity: args.events_capacity.unwrap_or(server.events_capacity).max(1),
            max_payload: args
                .max_payload
                .unwrap_or(toml_config.protocol.max_payload)
                .min(u32::MAX as usize),
            log_level: log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
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

//! Configuration module for the fastsocket server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::fast::packet::MIN_FRAME_LEN;
use crate::runtime::listener::ListenerOptions;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "fastsocket")]
#[command(version = "0.1.0")]
#[command(
    about = "A multi-protocol socket server speaking Fast, HTTP and policy on one port",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Default timeout for outgoing calls in seconds
    #[arg(long)]
    pub call_timeout: Option<u64>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

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
    pub fast: FastConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bytes requested per socket read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Largest accepted Fast frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            workers: None,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Fast protocol configuration
#[derive(Debug, Deserialize)]
pub struct FastConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// TLS configuration. Both paths must be set to enable TLS.
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
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
    "127.0.0.1:7000".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10000
}

fn default_buffer_size() -> usize {
    8 * 1024
}

fn default_max_frame_size() -> u32 {
    8 * 1024 * 1024 // 8 MB
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Certificate and key for TLS-wrapped sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_frame_size: u32,
    pub call_timeout: Duration,
    pub tls: Option<TlsPaths>,
    pub handshake_timeout: Duration,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let tls = match (
            cli.tls_cert.or(toml_config.tls.cert),
            cli.tls_key.or(toml_config.tls.key),
        ) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        if toml_config.server.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive"));
        }
        if toml_config.server.max_frame_size < MIN_FRAME_LEN {
            return Err(ConfigError::Invalid("max_frame_size is below the frame header size"));
        }
        let call_timeout_secs = cli
            .call_timeout
            .unwrap_or(toml_config.fast.call_timeout_secs);
        if call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout must be positive"));
        }

        Ok(Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections,
            buffer_size: toml_config.server.buffer_size,
            max_frame_size: toml_config.server.max_frame_size,
            call_timeout: Duration::from_secs(call_timeout_secs),
            tls,
            handshake_timeout: Duration::from_secs(toml_config.tls.handshake_timeout_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Listener tuning derived from this configuration.
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("TLS needs both a certificate and a key")]
    IncompleteTls,
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

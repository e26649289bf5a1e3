//! Configuration for the handoff server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::server::WorkerMode;
use crate::{MAX_WORKER, PORTNO};
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the handoff server
#[derive(Parser, Debug, Default)]
#[command(name = "tcp-handoff-server")]
#[command(version)]
#[command(about = "Framed TCP server with master-to-worker port handoff", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to
    #[arg(short = 'l', long)]
    pub listen: Option<IpAddr>,

    /// Master port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Serve data on the master connection instead of a worker port
    #[arg(long)]
    pub no_handoff: bool,

    /// Maximum number of live workers
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Worker isolation: one process or one thread per connection
    #[arg(long, value_enum)]
    pub mode: Option<WorkerMode>,

    /// Initial receive buffer capacity in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Cap on bytes per read/write call
    #[arg(long)]
    pub chunk_limit: Option<usize>,

    /// Largest message payload accepted, in bytes
    #[arg(long)]
    pub max_message: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hand each client off to a distinct worker port
    #[serde(default = "default_handoff")]
    pub handoff: bool,
    /// How often a blocked accept checks for shutdown
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            handoff: default_handoff(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_max_workers")]
    pub max: usize,
    #[serde(default)]
    pub mode: WorkerMode,
    /// Sleep between admission checks while at capacity
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max: default_max_workers(),
            mode: WorkerMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub chunk_limit: Option<usize>,
    /// Refuse payloads longer than this instead of growing the buffer
    #[serde(default)]
    pub max_message: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            chunk_limit: None,
            max_message: None,
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

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    PORTNO
}

fn default_handoff() -> bool {
    true
}

fn default_accept_poll_ms() -> u64 {
    250
}

fn default_max_workers() -> usize {
    MAX_WORKER
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_buffer_size() -> usize {
    crate::transport::DEFAULT_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: IpAddr,
    pub port: u16,
    pub handoff: bool,
    pub accept_poll: Duration,
    pub max_workers: usize,
    pub mode: WorkerMode,
    pub poll_interval: Duration,
    pub buffer_size: usize,
    pub chunk_limit: Option<usize>,
    pub max_message: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => Self::read_file(path)?,
            None => TomlConfig::default(),
        };
        Ok(Self::from_parts(cli, toml_config))
    }

    fn read_file(path: &Path) -> Result<TomlConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    /// Merge CLI args over file values.
    pub fn from_parts(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            port: cli.port.unwrap_or(file.server.port),
            handoff: file.server.handoff && !cli.no_handoff,
            accept_poll: Duration::from_millis(file.server.accept_poll_ms),
            max_workers: cli.max_workers.unwrap_or(file.workers.max),
            mode: cli.mode.unwrap_or(file.workers.mode),
            poll_interval: Duration::from_millis(file.workers.poll_interval_ms),
            buffer_size: cli.buffer_size.unwrap_or(file.transport.buffer_size),
            chunk_limit: cli.chunk_limit.or(file.transport.chunk_limit),
            max_message: cli.max_message.or(file.transport.max_message),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_parts(CliArgs::default(), TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), SocketAddr::from(([0, 0, 0, 0], 51717)));
        assert!(config.handoff);
        assert_eq!(config.max_workers, 7);
        assert_eq!(config.mode, WorkerMode::Process);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.buffer_size, 1);
        assert_eq!(config.chunk_limit, None);
        assert_eq!(config.max_message, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1"
            port = 6000
            handoff = false

            [workers]
            max = 3
            mode = "thread"

            [transport]
            buffer_size = 4096
            chunk_limit = 65536
            max_message = 1048576

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.server.port, 6000);
        assert!(!config.server.handoff);
        assert_eq!(config.server.accept_poll_ms, 250);
        assert_eq!(config.workers.max, 3);
        assert_eq!(config.workers.mode, WorkerMode::Thread);
        assert_eq!(config.transport.buffer_size, 4096);
        assert_eq!(config.transport.chunk_limit, Some(65536));
        assert_eq!(config.transport.max_message, Some(1_048_576));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[workers]\nmax = 3\nmode = \"thread\"").unwrap();
        let cli = CliArgs {
            port: Some(7000),
            max_workers: Some(9),
            no_handoff: true,
            log_level: Some("trace".into()),
            ..CliArgs::default()
        };

        let config = Config::from_parts(cli, file);
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_workers, 9);
        assert_eq!(config.mode, WorkerMode::Thread);
        assert!(!config.handoff);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::try_parse_from([
            "tcp-handoff-server",
            "--port",
            "6001",
            "--mode",
            "thread",
            "--chunk-limit",
            "1024",
            "--max-message",
            "65536",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.port, 6001);
        assert_eq!(config.mode, WorkerMode::Thread);
        assert_eq!(config.chunk_limit, Some(1024));
        assert_eq!(config.max_message, Some(65536));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 6002\naccept_poll_ms = 50").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            ..CliArgs::default()
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.port, 6002);
        assert_eq!(config.accept_poll, Duration::from_millis(50));
    }

    #[test]
    fn test_bad_file_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a port\"").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::TomlParse(..))
        ));

        let missing = CliArgs {
            config: Some(PathBuf::from("/nonexistent/tcp-handoff.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_cli(missing),
            Err(ConfigError::FileRead(..))
        ));
    }
}

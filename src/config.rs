//! Configuration module for reqrep-loadtest.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::Endpoint;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of server workers
pub const DEFAULT_SERVER_WORKERS: usize = 1024;

/// Default number of client workers
pub const DEFAULT_CLIENT_WORKERS: usize = 1;

/// Command-line arguments for the load tester
#[derive(Parser, Debug)]
#[command(name = "reqrep-loadtest")]
#[command(author = "reqrep-loadtest authors")]
#[command(version = "0.1.0")]
#[command(about = "Request/reply load generator with per-request server delay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of runtime threads (defaults to number of CPU cores)
    #[arg(short = 't', long, global = true, value_parser = parse_positive)]
    pub threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Answer requests after the delay each one asks for
    Server {
        /// Endpoint to listen on (e.g., tcp://127.0.0.1:5555)
        #[arg(value_parser = clap::value_parser!(Endpoint))]
        endpoint: Endpoint,

        /// Number of worker contexts [default: 1024]
        #[arg(value_parser = parse_positive)]
        workers: Option<usize>,
    },
    /// Issue requests back-to-back on independent connections
    Client {
        /// Endpoint to dial (e.g., tcp://127.0.0.1:5555)
        #[arg(value_parser = clap::value_parser!(Endpoint))]
        endpoint: Endpoint,

        /// Number of worker contexts, each on its own connection [default: 1]
        #[arg(value_parser = parse_positive)]
        workers: Option<usize>,

        /// Maximum server delay in ms; each request asks for max/2..max [default: 0]
        #[arg(value_parser = parse_positive_delay)]
        max_delay: Option<u32>,

        /// Seed for reproducible request delays
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Parse a strictly positive count.
fn parse_positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be positive".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Parse a strictly positive delay in milliseconds.
fn parse_positive_delay(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(0) => Err("must be positive".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Runtime-related configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of runtime threads
    pub threads: Option<usize>,
    /// Seconds between idle wake-ups of the harness
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: None,
            idle_interval_secs: default_idle_interval(),
        }
    }
}

/// Server role defaults
#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub workers: Option<usize>,
}

/// Client role defaults
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub workers: Option<usize>,
    pub max_delay_ms: Option<u32>,
    pub seed: Option<u64>,
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

fn default_idle_interval() -> u64 {
    60 // one minute
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server role settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub workers: usize,
}

/// Resolved client role settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub workers: usize,
    /// 0 disables request delays
    pub max_delay_ms: u32,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleConfig {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: RoleConfig,
    pub threads: Option<usize>,
    pub idle_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    ///
    /// Usage errors in the arguments print usage and exit the process.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let role = match cli.role {
            RoleArgs::Server { endpoint, workers } => RoleConfig::Server(ServerConfig {
                endpoint,
                workers: positive(
                    "server.workers",
                    workers.or(toml_config.server.workers),
                    DEFAULT_SERVER_WORKERS,
                )?,
            }),
            RoleArgs::Client {
                endpoint,
                workers,
                max_delay,
                seed,
            } => RoleConfig::Client(ClientConfig {
                endpoint,
                workers: positive(
                    "client.workers",
                    workers.or(toml_config.client.workers),
                    DEFAULT_CLIENT_WORKERS,
                )?,
                max_delay_ms: max_delay.or(toml_config.client.max_delay_ms).unwrap_or(0),
                seed: seed.or(toml_config.client.seed),
            }),
        };

        let threads = cli.threads.or(toml_config.runtime.threads);
        if threads == Some(0) {
            return Err(ConfigError::InvalidValue("runtime.threads", 0));
        }
        if toml_config.runtime.idle_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("runtime.idle_interval_secs", 0));
        }

        Ok(Config {
            role,
            threads,
            idle_interval: Duration::from_secs(toml_config.runtime.idle_interval_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn positive(field: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::InvalidValue(field, 0)),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .path.display(), .source)]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {}", .path.display(), .source)]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value {1} for {0}: must be positive")]
    InvalidValue(&'static str, u64),
}

//! Configuration module for the muxgate gateway.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::dispatcher::UnsolicitedPolicy;
use crate::framing::Framing;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted per-request timeout
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest accepted engine poll budget
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted shutdown drain
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(60 * 60);

/// Command-line arguments for the gateway
#[derive(Parser, Debug)]
#[command(name = "muxgate")]
#[command(version)]
#[command(about = "Multiplexes many TCP clients onto one serialized JSON engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Seconds to wait for an engine reply before failing the request
    #[arg(short = 't', long)]
    pub request_timeout: Option<u64>,

    /// Maximum number of simultaneous client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Request/reply framing on client sockets
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Payload field carrying the correlation tag
    #[arg(long)]
    pub tag_field: Option<String>,

    /// What to do with engine messages no client asked for
    #[arg(long, value_enum)]
    pub unsolicited: Option<UnsolicitedPolicy>,

    /// Engine executable (implies the process engine)
    #[arg(long)]
    pub engine_command: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Let several processes share the listen port (SO_REUSEPORT)
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default)]
    pub framing: Framing,
    /// Largest accepted request frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            reuse_port: false,
            framing: Framing::default(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Correlation and dispatch configuration
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Engine poll budget in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_tag_field")]
    pub tag_field: String,
    /// Per-session outbound queue capacity
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default)]
    pub unsolicited: UnsolicitedPolicy,
    /// Broadcast backlog per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How long shutdown waits for sessions to drain, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            tag_field: default_tag_field(),
            queue_depth: default_queue_depth(),
            unsolicited: UnsolicitedPolicy::default(),
            event_capacity: default_event_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Which engine implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process echo engine
    #[default]
    Loopback,
    /// Child process speaking line-delimited JSON on stdin/stdout
    Process,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
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

fn default_max_connections() -> usize {
    1024
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_tag_field() -> String {
    "@extra".to_string()
}

fn default_queue_depth() -> usize {
    1
}

fn default_event_capacity() -> usize {
    256
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub backlog: u32,
    pub reuse_port: bool,
    pub framing: Framing,
    pub max_frame_size: usize,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub tag_field: String,
    pub queue_depth: usize,
    pub unsolicited: UnsolicitedPolicy,
    pub event_capacity: usize,
    pub shutdown_grace: Duration,
    pub engine: EngineConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file they point at (if any).
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            gateway,
            mut engine,
            logging,
        } = toml_config;

        if let Some(command) = cli.engine_command {
            engine.kind = EngineKind::Process;
            engine.command = Some(command);
        }

        let config = Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            backlog: server.backlog,
            reuse_port: server.reuse_port,
            framing: cli.framing.unwrap_or(server.framing),
            max_frame_size: server.max_frame_size,
            request_timeout: Duration::from_secs(
                cli.request_timeout.unwrap_or(gateway.request_timeout),
            ),
            poll_interval: Duration::from_millis(gateway.poll_interval_ms),
            tag_field: cli.tag_field.unwrap_or(gateway.tag_field),
            queue_depth: gateway.queue_depth,
            unsolicited: cli.unsolicited.unwrap_or(gateway.unsolicited),
            event_capacity: gateway.event_capacity,
            shutdown_grace: Duration::from_millis(gateway.shutdown_grace_ms),
            engine,
            log_level: cli.log_level.unwrap_or(logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));

        if self.max_frame_size == 0 {
            return invalid("max_frame_size must be greater than zero");
        }
        if self.queue_depth == 0 {
            return invalid("queue_depth must be greater than zero");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be greater than zero");
        }
        if self.tag_field.is_empty() {
            return invalid("tag_field must not be empty");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval_ms must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be greater than zero");
        }
        if self.request_timeout > MAX_REQUEST_TIMEOUT {
            return invalid("request_timeout must be at most 86400 seconds");
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return invalid("poll_interval_ms must be at most 60000");
        }
        if self.shutdown_grace > MAX_SHUTDOWN_GRACE {
            return invalid("shutdown_grace_ms must be at most 3600000");
        }
        if self.engine.kind == EngineKind::Process && self.engine.command.is_none() {
            return invalid("engine kind 'process' requires a command");
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("muxgate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.tag_field, "@extra");
        assert_eq!(config.queue_depth, 1);
        assert_eq!(config.framing, Framing::Line);
        assert_eq!(config.unsolicited, UnsolicitedPolicy::Log);
        assert_eq!(config.engine.kind, EngineKind::Loopback);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            workers = 4
            max_connections = 16
            framing = "length"

            [gateway]
            request_timeout = 5
            tag_field = "tag"
            unsolicited = "broadcast"

            [engine]
            kind = "process"
            command = "tdlib-json-cli"
            args = ["--verbose"]

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.server.listen, "127.0.0.1:9000");
        assert_eq!(parsed.server.workers, Some(4));
        assert_eq!(parsed.server.backlog, 1024);
        assert!(!parsed.server.reuse_port);
        assert_eq!(parsed.gateway.poll_interval_ms, 1000);

        let config = Config::merge(cli(&[]), parsed).unwrap();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.framing, Framing::Length);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.tag_field, "tag");
        assert_eq!(config.unsolicited, UnsolicitedPolicy::Broadcast);
        assert_eq!(config.engine.command.as_deref(), Some("tdlib-json-cli"));
        assert_eq!(config.engine.args, vec!["--verbose".to_string()]);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let parsed: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let args = cli(&[
            "--listen",
            "127.0.0.1:7000",
            "--request-timeout",
            "2",
            "--unsolicited",
            "drop",
            "--engine-command",
            "cat",
            "--log-level",
            "trace",
        ]);
        let config = Config::merge(args, parsed).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.unsolicited, UnsolicitedPolicy::Drop);
        assert_eq!(config.engine.kind, EngineKind::Process);
        assert_eq!(config.engine.command.as_deref(), Some("cat"));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validation() {
        let parsed: TomlConfig = toml::from_str("[gateway]\nqueue_depth = 0").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), parsed),
            Err(ConfigError::Invalid(_))
        ));

        let parsed: TomlConfig = toml::from_str("[engine]\nkind = \"process\"").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), parsed),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            Config::merge(cli(&["--tag-field", ""]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_duration_upper_bounds() {
        let huge = u64::MAX.to_string();
        assert!(matches!(
            Config::merge(cli(&["--request-timeout", &huge]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let at_limit = MAX_REQUEST_TIMEOUT.as_secs().to_string();
        let config = Config::merge(cli(&["--request-timeout", &at_limit]), TomlConfig::default()).unwrap();
        assert_eq!(config.request_timeout, MAX_REQUEST_TIMEOUT);

        let parsed: TomlConfig =
            toml::from_str("[gateway]\nshutdown_grace_ms = 9223372036854775807").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), parsed),
            Err(ConfigError::Invalid(_))
        ));

        let parsed: TomlConfig = toml::from_str("[gateway]\npoll_interval_ms = 600000").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), parsed),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        assert!(toml::from_str::<TomlConfig>("[server]\nframing = \"xml\"").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::from_args(cli(&["--config", "/nonexistent/muxgate.toml"]));
        assert!(matches!(result, Err(ConfigError::FileRead(..))));
    }
}

//! Configuration for the dup server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. Invalid knob
//! combinations are rejected here, at startup, never at runtime.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "dup-server")]
#[command(version = "0.1.0")]
#[command(about = "A flow-controlled line duplication server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:5003)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Base delay between produced chunks in milliseconds (0 = no pacing)
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Uniform jitter applied to the chunk delay, in milliseconds
    #[arg(long)]
    pub delay_jitter_ms: Option<u64>,

    /// Duplicated lines emitted per output chunk
    #[arg(long)]
    pub lines_per_chunk: Option<usize>,

    /// Maximum accepted input line length in bytes
    #[arg(long)]
    pub max_line_len: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub response: ResponseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Response pacing and batching
#[derive(Debug, Deserialize)]
pub struct ResponseConfig {
    /// Base inter-chunk delay in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
    /// Uniform jitter applied to the delay, in milliseconds
    #[serde(default)]
    pub delay_jitter_ms: u64,
    /// Duplicated lines per output chunk
    #[serde(default = "default_lines_per_chunk")]
    pub lines_per_chunk: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            delay_jitter_ms: 0,
            lines_per_chunk: default_lines_per_chunk(),
        }
    }
}

/// Connection and buffering limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted input line length in bytes
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Outbound bytes below which a paused connection resumes
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Outbound bytes above which production pauses
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Maximum concurrent connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            max_connections: default_max_connections(),
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
    "127.0.0.1:5003".to_string()
}

fn default_lines_per_chunk() -> usize {
    128
}

fn default_max_line_len() -> usize {
    64 * 1024
}

fn default_low_watermark() -> usize {
    64 * 1024
}

fn default_high_watermark() -> usize {
    256 * 1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub delay_ms: u64,
    pub delay_jitter_ms: u64,
    pub lines_per_chunk: usize,
    pub max_line_len: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            delay_ms: cli.delay_ms.unwrap_or(toml_config.response.delay_ms),
            delay_jitter_ms: cli
                .delay_jitter_ms
                .unwrap_or(toml_config.response.delay_jitter_ms),
            lines_per_chunk: cli
                .lines_per_chunk
                .unwrap_or(toml_config.response.lines_per_chunk),
            max_line_len: cli.max_line_len.unwrap_or(toml_config.limits.max_line_len),
            low_watermark: toml_config.limits.low_watermark,
            high_watermark: toml_config.limits.high_watermark,
            max_connections: toml_config.limits.max_connections,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lines_per_chunk == 0 {
            return Err(ConfigError::Invalid("lines_per_chunk must be at least 1"));
        }
        if self.max_line_len == 0 {
            return Err(ConfigError::Invalid("max_line_len must be at least 1"));
        }
        if self.high_watermark == 0 {
            return Err(ConfigError::Invalid("high_watermark must be at least 1"));
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::Invalid(
                "low_watermark must not exceed high_watermark",
            ));
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
            ConfigError::Invalid(reason) => {
                write!(f, "Invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:5003");
        assert_eq!(config.response.lines_per_chunk, 128);
        assert_eq!(config.response.delay_ms, 0);
        assert_eq!(config.limits.max_line_len, 64 * 1024);
        assert_eq!(config.limits.low_watermark, 64 * 1024);
        assert_eq!(config.limits.high_watermark, 256 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:5003"
            workers = 4

            [response]
            delay_ms = 2
            delay_jitter_ms = 2
            lines_per_chunk = 16

            [limits]
            max_line_len = 1024
            high_watermark = 131072

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:5003");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.response.delay_ms, 2);
        assert_eq!(config.response.delay_jitter_ms, 2);
        assert_eq!(config.response.lines_per_chunk, 16);
        assert_eq!(config.limits.max_line_len, 1024);
        assert_eq!(config.limits.high_watermark, 131072);
        // Untouched sections keep their defaults
        assert_eq!(config.limits.low_watermark, 64 * 1024);
        assert_eq!(config.logging.level, "debug");
    }

    fn valid_config() -> Config {
        Config {
            listen: default_listen(),
            delay_ms: 0,
            delay_jitter_ms: 0,
            lines_per_chunk: 1,
            max_line_len: 1024,
            low_watermark: 256,
            high_watermark: 512,
            max_connections: 16,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = Config {
            lines_per_chunk: 0,
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_watermarks() {
        let config = Config {
            low_watermark: 512,
            high_watermark: 256,
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }
}

//! Broadcaster Configuration
//!
//! TOML-based configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broadcast: BroadcastConfig,
    pub database: DatabaseConfig,

    /// Data directory for local storage
    pub data_dir: String,

    /// Enable development mode
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broadcast: BroadcastConfig::default(),
            database: DatabaseConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// How the global send-rate ceiling is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Count sends in a fixed 60s window; pause until the window ends once full
    FixedWindow,
    /// Space sends evenly at 60s / limit, no bursts
    Smooth,
}

impl Default for RateLimitStrategy {
    fn default() -> Self {
        Self::FixedWindow
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedWindow => f.write_str("fixed_window"),
            Self::Smooth => f.write_str("smooth"),
        }
    }
}

impl FromStr for RateLimitStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" | "fixed" => Ok(Self::FixedWindow),
            "smooth" => Ok(Self::Smooth),
            other => Err(ConfigError::EnvError(format!(
                "unknown rate limit strategy '{}'",
                other
            ))),
        }
    }
}

/// Broadcast dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Maximum send attempts per minute across all running broadcasts
    pub rate_limit_per_minute: u32,
    /// Pause between two sends of the same broadcast, in milliseconds
    pub delay_ms: u64,
    /// Largest number of active recipients a single broadcast may target
    pub max_recipients: usize,
    /// Persist progress counters every N attempted recipients
    pub flush_every: usize,
    pub rate_limit_strategy: RateLimitStrategy,
    /// Attempts made to persist the final job status
    pub finalize_retries: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
            delay_ms: 1000,
            max_recipients: 100,
            flush_every: 10,
            rate_limit_strategy: RateLimitStrategy::FixedWindow,
            finalize_retries: 3,
        }
    }
}

/// Job store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URI; `memory` selects the in-process store
    pub uri: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: "sqlite://./data/broadcast.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the dispatch engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.broadcast;
        if b.rate_limit_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "broadcast.rate_limit_per_minute must be greater than zero".to_string(),
            ));
        }
        if b.max_recipients == 0 {
            return Err(ConfigError::ValidationError(
                "broadcast.max_recipients must be greater than zero".to_string(),
            ));
        }
        if b.flush_every == 0 {
            return Err(ConfigError::ValidationError(
                "broadcast.flush_every must be greater than zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Broadcaster Configuration
# Environment variables (BROADCAST_*) override these settings

[broadcast]
rate_limit_per_minute = 10
delay_ms = 1000
max_recipients = 100
flush_every = 10
rate_limit_strategy = "fixed_window"  # fixed_window or smooth
finalize_retries = 3

[database]
uri = "sqlite://./data/broadcast.db?mode=rwc"  # or "memory"
max_connections = 5

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}

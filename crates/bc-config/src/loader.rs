//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "broadcast.toml",
    "config.toml",
    "./config/broadcast.toml",
    "/etc/broadcaster/broadcast.toml",
];

/// Env var naming an explicit config file
const CONFIG_PATH_VAR: &str = "BROADCAST_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured config file does not exist, falling back");
        }

        if let Ok(path) = env::var(CONFIG_PATH_VAR) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `BROADCAST_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored with a warning.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let b = &mut config.broadcast;
    override_parsed(&lookup, "BROADCAST_RATE_LIMIT", &mut b.rate_limit_per_minute);
    override_parsed(&lookup, "BROADCAST_DELAY_MS", &mut b.delay_ms);
    override_parsed(&lookup, "BROADCAST_MAX_RECIPIENTS", &mut b.max_recipients);
    override_parsed(&lookup, "BROADCAST_FLUSH_EVERY", &mut b.flush_every);
    override_parsed(&lookup, "BROADCAST_FINALIZE_RETRIES", &mut b.finalize_retries);
    override_parsed(&lookup, "BROADCAST_RATE_LIMIT_STRATEGY", &mut b.rate_limit_strategy);

    if let Some(val) = lookup("BROADCAST_DB_URI") {
        config.database.uri = val;
    }
    override_parsed(&lookup, "BROADCAST_DB_MAX_CONNECTIONS", &mut config.database.max_connections);

    if let Some(val) = lookup("BROADCAST_DATA_DIR") {
        config.data_dir = val;
    }
    override_parsed(&lookup, "BROADCAST_DEV_MODE", &mut config.dev_mode);
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "Ignoring unparseable configuration override"),
    }
}

//! Configuration discovery and resolution

use super::types::Config;
use crate::home::expand_tilde;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parsing error in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Path to config file override. Unlike the global config, a failure to
    /// read or parse this file is an error.
    pub config_path: Option<PathBuf>,
    /// Override the chat database location
    pub database: Option<PathBuf>,
    /// Override the watched paths
    pub watch_paths: Vec<PathBuf>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Explicit config file, else global config (~/.config/chatsync/config.toml)
/// 4. Defaults
///
/// Leading `~/` in any configured path is expanded against `home_dir`.
pub fn resolve_config(overrides: &ConfigOverrides, home_dir: &Path) -> Result<Config, ConfigError> {
    let mut config = match overrides.config_path {
        Some(ref path) => load_config_file(path)?,
        None => {
            let global_config_path = home_dir.join(".config/chatsync/config.toml");
            if global_config_path.exists() {
                load_config_file(&global_config_path).unwrap_or_else(|e| {
                    warn!("Failed to parse global config: {e}");
                    Config::default()
                })
            } else {
                Config::default()
            }
        }
    };

    apply_env_overrides(&mut config);
    apply_cli_overrides(&mut config, overrides);

    config.listener.database = expand_tilde(&config.listener.database, home_dir);
    config.listener.paths = config
        .listener
        .paths
        .iter()
        .map(|p| expand_tilde(p, home_dir))
        .collect();

    Ok(config)
}

/// Load config from a TOML file
fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

fn positive_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut Config) {
    if let Some(database) = std::env::var("CHATSYNC_DATABASE")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        config.listener.database = PathBuf::from(database.trim());
    }

    if let Some(ms) = positive_env("CHATSYNC_DEBOUNCE_MS") {
        config.listener.debounce_ms = ms;
    }

    if let Some(capacity) = positive_env("CHATSYNC_CACHE_CAPACITY") {
        config.cache.capacity = capacity as usize;
    }
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(ref database) = overrides.database {
        config.listener.database = database.clone();
    }

    if !overrides.watch_paths.is_empty() {
        config.listener.paths = overrides.watch_paths.clone();
    }
}

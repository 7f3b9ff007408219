//! Configuration resolution
//!
//! Resolves configuration from multiple sources with priority:
//! 1. Command-line flags (passed as parameters)
//! 2. Environment variables
//! 3. Explicit config file, or global config (~/.config/chatsync/config.toml)
//! 4. Defaults

mod discovery;
mod types;

pub use discovery::{ConfigError, ConfigOverrides, resolve_config};
pub use types::{CacheConfig, Config, ListenerConfig, PollersConfig};

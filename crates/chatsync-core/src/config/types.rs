//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default chat database location, relative to the home directory.
pub const DEFAULT_DATABASE: &str = "~/Library/Messages/chat.db";

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Change detection and poll scheduling
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Per-poller de-duplication cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Which source pollers are registered
    #[serde(default)]
    pub pollers: PollersConfig,
}

/// Change detection and poll scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Chat database the pollers read from
    pub database: PathBuf,
    /// Files whose modifications trigger a poll. Empty means the database
    /// file plus its `-wal` sibling.
    pub paths: Vec<PathBuf>,
    /// Trailing quiet window before a burst of changes is polled
    pub debounce_ms: u64,
    /// Pause applied after a poll when other change handlers are queued
    pub settle_delay_ms: u64,
    /// Look-back subtracted from the oldest watched mtime at startup
    pub seed_lookback_secs: u64,
    /// Look-back subtracted from the previous mtime on each change
    pub lookback_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            paths: Vec::new(),
            debounce_ms: 500,
            settle_delay_ms: 100,
            seed_lookback_secs: DEFAULT_SEED_LOOKBACK_SECS,
            lookback_secs: DEFAULT_LOOKBACK_SECS,
        }
    }
}

impl ListenerConfig {
    /// Paths handed to the change notifier.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        if !self.paths.is_empty() {
            return self.paths.clone();
        }
        let mut wal = self.database.clone().into_os_string();
        wal.push("-wal");
        vec![self.database.clone(), PathBuf::from(wal)]
    }

    pub fn debounce_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn seed_lookback(&self) -> chrono::Duration {
        lookback_or_default("seed_lookback_secs", self.seed_lookback_secs, DEFAULT_SEED_LOOKBACK_SECS)
    }

    pub fn lookback(&self) -> chrono::Duration {
        lookback_or_default("lookback_secs", self.lookback_secs, DEFAULT_LOOKBACK_SECS)
    }
}

const DEFAULT_SEED_LOOKBACK_SECS: u64 = 60;
const DEFAULT_LOOKBACK_SECS: u64 = 30;

/// `secs` as a duration, or `default` when it does not fit one.
fn lookback_or_default(field: &str, secs: u64, default: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(|| {
            tracing::warn!("listener.{} = {} is out of range, using {}", field, secs, default);
            chrono::Duration::seconds(default as i64)
        })
}

/// De-duplication cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum keys retained per poller after a trim
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Poller registration switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollersConfig {
    /// New and updated message rows
    pub messages: bool,
    /// Chat read-status changes
    pub chat_read_status: bool,
}

impl Default for PollersConfig {
    fn default() -> Self {
        Self {
            messages: true,
            chat_read_status: true,
        }
    }
}

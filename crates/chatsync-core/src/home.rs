//! Canonical home directory resolution for chatsync
//!
//! # Precedence
//!
//! 1. `CHATSYNC_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default
//!
//! Tests that touch the filesystem should point `CHATSYNC_HOME` at a temp dir
//! so the default database and config paths resolve inside it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get the home directory for chatsync operations
///
/// # Errors
///
/// Returns an error if `CHATSYNC_HOME` is not set and the platform home
/// directory cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("CHATSYNC_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

/// Expand a leading `~/` against `home`. Other paths are returned unchanged.
pub fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

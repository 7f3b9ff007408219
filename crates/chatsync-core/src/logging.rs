//! Shared logging initialization for chatsync binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level(raw: Option<&str>) -> tracing::Level {
    match raw.unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `CHATSYNC_LOG`.
///
/// This is safe to call multiple times; only the first call initializes the
/// subscriber. It is best-effort and never returns an error.
pub fn init() {
    let level = parse_level(std::env::var("CHATSYNC_LOG").ok().as_deref());
    init_with_level(level);
}

/// Initialize tracing output at a fixed level, ignoring `CHATSYNC_LOG`.
pub fn init_with_level(level: tracing::Level) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}

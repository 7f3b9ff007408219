//! Core types and plumbing for chatsync
//!
//! This crate provides the pieces shared by every chatsync binary:
//! - Configuration types and resolution (`config`)
//! - Home directory resolution (`home`)
//! - Process-level logging setup (`logging`)
//! - Conversion between the chat store's Apple-epoch timestamps and UTC (`time`)

pub mod config;
pub mod home;
pub mod logging;
pub mod time;

pub use config::{CacheConfig, Config, ListenerConfig, PollersConfig};

// Re-export toml for callers that build config tables in tests
pub use toml;

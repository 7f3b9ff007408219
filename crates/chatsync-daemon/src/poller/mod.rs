//! Source pollers: one per event family, each reading rows newer than a
//! watermark out of the chat store and turning them into typed events.

pub mod cache;
pub mod chat;
pub mod message;
pub mod store;

pub use cache::DedupCache;
pub use chat::ChatUpdatePoller;
pub use message::MessagePoller;
pub use store::{ChatDatabase, ChatReadRow, MessageRow};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// Event families produced by the pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// A message row seen for the first time
    NewEntry,
    /// A known message row whose delivery/read/error state changed
    UpdatedEntry,
    /// An outgoing message that failed to send
    MessageSendError,
    /// A chat was marked as read
    ChatReadStatusChanged,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::NewEntry,
        EventType::UpdatedEntry,
        EventType::MessageSendError,
        EventType::ChatReadStatusChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewEntry => "new-entry",
            EventType::UpdatedEntry => "updated-entry",
            EventType::MessageSendError => "message-send-error",
            EventType::ChatReadStatusChanged => "chat-read-status-changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event produced by a poller, consumed once by the event sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl PollResult {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Errors raised while a poller reads the store. These are isolated per
/// poller and per cycle by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("failed to open chat database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("chat database query failed: {source}")]
    Query {
        #[from]
        source: rusqlite::Error,
    },

    #[error("store read task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("poller error: {message}")]
    Other { message: String },
}

/// A source of events for one event family.
///
/// `poll` returns every not-yet-delivered event for rows modified strictly
/// after `after`, in the rows' chronological order. It must be read-only with
/// respect to the store and idempotent for keys already in its cache, so an
/// earlier `after` than the previous call only re-reads, never re-emits.
///
/// Uses RPITIT (Return Position Impl Trait in Traits) with explicit Send bounds.
pub trait SourcePoller: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Read rows newer than `after` and convert the unseen ones to events.
    fn poll(
        &mut self,
        after: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<PollResult>, PollerError>> + Send;

    /// Bound the de-duplication caches. Called by the coordinator once per
    /// emitting cycle.
    fn trim_caches(&mut self);
}

/// Object-safe version of SourcePoller for the coordinator's registry.
///
/// This trait is implemented automatically for all types that implement
/// SourcePoller.
pub trait ErasedPoller: Send + Sync {
    fn name(&self) -> &'static str;
    fn poll<'a>(
        &'a mut self,
        after: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PollResult>, PollerError>> + Send + 'a>>;
    fn trim_caches(&mut self);
}

impl<T: SourcePoller> ErasedPoller for T {
    fn name(&self) -> &'static str {
        SourcePoller::name(self)
    }

    fn poll<'a>(
        &'a mut self,
        after: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PollResult>, PollerError>> + Send + 'a>> {
        Box::pin(SourcePoller::poll(self, after))
    }

    fn trim_caches(&mut self) {
        SourcePoller::trim_caches(self)
    }
}

//! Chat read-status poller.

use super::cache::DedupCache;
use super::store::ChatDatabase;
use super::{EventType, PollResult, PollerError, SourcePoller};
use chrono::{DateTime, Utc};
use tracing::debug;

pub struct ChatUpdatePoller {
    db: ChatDatabase,
    states: DedupCache,
}

impl ChatUpdatePoller {
    pub fn new(db: ChatDatabase, cache_capacity: usize) -> Self {
        Self {
            db,
            states: DedupCache::new(cache_capacity),
        }
    }
}

impl SourcePoller for ChatUpdatePoller {
    fn name(&self) -> &'static str {
        "chat-read-status"
    }

    async fn poll(&mut self, after: DateTime<Utc>) -> Result<Vec<PollResult>, PollerError> {
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || db.chats_read_after(after)).await??;

        let results: Vec<PollResult> = rows
            .into_iter()
            .filter(|row| self.states.insert(row.state_key()))
            .map(|row| PollResult::new(EventType::ChatReadStatusChanged, row.to_payload()))
            .collect();
        debug!("chat-read-status: {} event(s) after {}", results.len(), after);
        Ok(results)
    }

    fn trim_caches(&mut self) {
        self.states.trim();
    }
}

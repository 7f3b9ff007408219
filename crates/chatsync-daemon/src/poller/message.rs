//! Message poller: new messages, delivery/read receipts and send failures.

use super::cache::DedupCache;
use super::store::{ChatDatabase, MessageRow};
use super::{EventType, PollResult, PollerError, SourcePoller};
use chrono::{DateTime, Utc};
use tracing::debug;

pub struct MessagePoller {
    db: ChatDatabase,
    /// Delivered states (`guid:delivered:read:error`)
    states: DedupCache,
    /// Guids observed at least once, to tell new rows from updated ones
    guids: DedupCache,
}

impl MessagePoller {
    pub fn new(db: ChatDatabase, cache_capacity: usize) -> Self {
        Self {
            db,
            states: DedupCache::new(cache_capacity),
            guids: DedupCache::new(cache_capacity),
        }
    }

    /// Turn freshly queried rows into events, skipping states already seen.
    fn process_rows(&mut self, rows: Vec<MessageRow>) -> Vec<PollResult> {
        let mut results = Vec::new();
        for row in rows {
            if !self.states.insert(row.state_key()) {
                continue;
            }

            let event_type = if self.guids.insert(row.guid.clone()) {
                EventType::NewEntry
            } else {
                EventType::UpdatedEntry
            };
            let payload = row.to_payload();

            if row.is_from_me && row.error != 0 {
                results.push(PollResult::new(event_type, payload.clone()));
                results.push(PollResult::new(EventType::MessageSendError, payload));
            } else {
                results.push(PollResult::new(event_type, payload));
            }
        }
        results
    }
}

impl SourcePoller for MessagePoller {
    fn name(&self) -> &'static str {
        "messages"
    }

    async fn poll(&mut self, after: DateTime<Utc>) -> Result<Vec<PollResult>, PollerError> {
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || db.messages_updated_after(after)).await??;
        let fetched = rows.len();
        let results = self.process_rows(rows);
        debug!(
            "messages: {} row(s) after {}, {} event(s)",
            fetched,
            after,
            results.len()
        );
        Ok(results)
    }

    fn trim_caches(&mut self) {
        self.states.trim();
        self.guids.trim();
    }
}

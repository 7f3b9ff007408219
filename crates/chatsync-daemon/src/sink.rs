//! Event sink: where poll results leave the pipeline.
//!
//! The coordinator only knows the [`EventSink`] trait. [`EventBus`] is the
//! in-process implementation consumers subscribe to by event type. Dispatch is
//! synchronous and fire-and-forget; a panicking subscriber or a dropped
//! channel receiver is logged and never reaches the coordinator.

use crate::poller::{EventType, PollResult};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Receives every result the coordinator emits, in emission order.
pub trait EventSink: Send + Sync {
    fn emit(&self, result: PollResult);
}

type Callback = Arc<dyn Fn(&PollResult) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<PollResult>),
}

/// Subscribe-by-type event dispatcher.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous callback for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&PollResult) + Send + Sync + 'static,
    {
        self.write()
            .entry(event_type)
            .or_default()
            .push(Subscriber::Callback(Arc::new(handler)));
    }

    /// Register a channel for one event type, for async consumers.
    pub fn subscribe_channel(&self, event_type: EventType) -> mpsc::UnboundedReceiver<PollResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write()
            .entry(event_type)
            .or_default()
            .push(Subscriber::Channel(tx));
        rx
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.read().get(&event_type).map(Vec::len).unwrap_or(0)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EventType, Vec<Subscriber>>> {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EventType, Vec<Subscriber>>> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for EventBus {
    fn emit(&self, result: PollResult) {
        // Snapshot so callbacks may subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .read()
            .get(&result.event_type)
            .cloned()
            .unwrap_or_default();

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
                        error!(
                            "Subscriber for {} panicked; event dropped for it",
                            result.event_type
                        );
                    }
                }
                Subscriber::Channel(tx) => {
                    if tx.send(result.clone()).is_err() {
                        warn!("Channel subscriber for {} is closed", result.event_type);
                    }
                }
            }
        }
    }
}

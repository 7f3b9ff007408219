//! Main listener loop: change notifier → debounce gate → poll coordinator.

use crate::listener::coordinator::{PollCoordinator, PollOutcome};
use crate::listener::debounce::DebounceGate;
use crate::listener::watcher::{ChangeEvent, ChangeNotifier, WatchError, WatchEvent};
use anyhow::Result;
use chatsync_core::ListenerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Debounce key for the chat database. All watched files feed one stream.
pub const CHAT_DB_KEY: &str = "chat-db-listener";

/// How long `stop` waits for in-flight polls before giving up on them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires a coordinator to a change notifier through a debounce gate.
pub struct ChatListener {
    coordinator: Arc<PollCoordinator>,
    notifier: ChangeNotifier,
    gate: DebounceGate<ChangeEvent, PollOutcome>,
    in_flight: JoinSet<Option<PollOutcome>>,
}

impl ChatListener {
    pub fn new(coordinator: Arc<PollCoordinator>, config: &ListenerConfig) -> Self {
        let handler_coordinator = Arc::clone(&coordinator);
        let gate = DebounceGate::new(config.debounce_wait(), move |event: ChangeEvent| {
            let coordinator = Arc::clone(&handler_coordinator);
            async move { coordinator.handle_change_event(event).await }
        });
        Self {
            coordinator,
            notifier: ChangeNotifier::new(config.watched_paths()),
            gate,
            in_flight: JoinSet::new(),
        }
    }

    pub fn coordinator(&self) -> &Arc<PollCoordinator> {
        &self.coordinator
    }

    /// Seed and warm the coordinator, then start the change notifier.
    /// Returns the receiver for notifier output.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<WatchEvent>, WatchError> {
        self.coordinator.start().await;
        let (tx, rx) = mpsc::channel(256);
        let watched = self.notifier.start(tx)?;
        info!("Listening for changes in {} director(ies)", watched);
        Ok(rx)
    }

    /// Route one notifier event. Changes go through the debounce gate; the
    /// resulting poll runs on its own task so the loop keeps draining events.
    pub fn on_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Changed(change) => {
                let outcome = self.gate.call(CHAT_DB_KEY, change);
                self.in_flight.spawn(outcome);
            }
            WatchEvent::Error(message) => {
                warn!("Change notifier reported an error: {}", message);
            }
        }
    }

    /// Reap finished change handlers. Returns `None` when nothing is in flight.
    pub async fn next_outcome(&mut self) -> Option<Option<PollOutcome>> {
        match self.in_flight.join_next().await? {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Change handler task failed: {}", e);
                Some(None)
            }
        }
    }

    /// Remove the notifier's subscriptions and drop any debounced execution
    /// that has not fired yet. Polls already running are allowed to finish.
    pub async fn stop(&mut self) {
        self.notifier.stop().await;
        self.gate.cancel();

        let drain = async {
            while let Some(res) = self.in_flight.join_next().await {
                if let Err(e) = res {
                    error!("Change handler task failed during shutdown: {}", e);
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("In-flight polls did not finish within {:?}", DRAIN_TIMEOUT);
            self.in_flight.abort_all();
        }
        info!("Chat listener stopped");
    }
}

/// Run the listener until `cancel` fires.
///
/// A notifier that cannot watch anything leaves the pipeline idle rather than
/// failing the process; the loop still waits for cancellation.
pub async fn run(
    coordinator: Arc<PollCoordinator>,
    config: &ListenerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Initializing chat listener");
    let mut listener = ChatListener::new(coordinator, config);

    let mut events = match listener.start().await {
        Ok(rx) => Some(rx),
        Err(e) => {
            error!("Change notifier failed to start; no polls will run: {}", e);
            None
        }
    };

    info!("Chat listener running. Waiting for cancellation signal...");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancellation signal received. Beginning shutdown...");
                break;
            }
            event = recv_or_pending(&mut events) => match event {
                Some(event) => listener.on_watch_event(event),
                None => {
                    warn!("Change notifier channel closed");
                    events = None;
                }
            },
            Some(outcome) = listener.next_outcome() => {
                debug!("Change handled: {:?}", outcome);
            }
        }
    }

    listener.stop().await;
    info!("Chat listener shutdown complete");
    Ok(())
}

async fn recv_or_pending(events: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

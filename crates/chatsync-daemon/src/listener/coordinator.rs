//! Poll coordinator: owns the poller registry, the watermark and the lock
//! that keeps at most one poll cycle running at a time.
//!
//! Lifecycle:
//! 1. Register pollers on an owned `PollCoordinator` (the registry is frozen
//!    once the coordinator is shared behind an `Arc`).
//! 2. [`PollCoordinator::start`] seeds the watermark from the watched files'
//!    mtimes and runs a silent cache-warming poll.
//! 3. [`PollCoordinator::handle_change_event`] runs for every debounced
//!    change notification.
//!
//! Overlapping poll windows are expected; the pollers' caches keep them from
//! re-emitting.

use crate::listener::watcher::{ChangeEvent, modified_at};
use crate::poller::{ErasedPoller, SourcePoller};
use crate::sink::EventSink;
use chatsync_core::ListenerConfig;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Timing knobs for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Files whose mtimes seed the watermark at startup
    pub paths: Vec<PathBuf>,
    /// Pause before releasing the lock when other handlers are queued
    pub settle_delay: Duration,
    /// Look-back applied to the seed watermark
    pub seed_lookback: chrono::Duration,
    /// Look-back applied to a change event's previous mtime
    pub lookback: chrono::Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            paths: config.watched_paths(),
            settle_delay: config.settle_delay(),
            seed_lookback: config.seed_lookback(),
            lookback: config.lookback(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

/// What a change notification led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The change was already covered by the watermark
    Skipped,
    /// A poll ran over `(after, now]` and emitted `emitted` events
    Polled { after: DateTime<Utc>, emitted: usize },
}

/// State guarded by the coordination lock
struct CoordinatorState {
    watermark: DateTime<Utc>,
    pollers: Vec<Box<dyn ErasedPoller>>,
}

/// Counts a handler as queued on the lock until dropped, including when the
/// handler's future is dropped while still waiting.
struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PollCoordinator {
    state: Mutex<CoordinatorState>,
    /// Handlers currently blocked on `state`
    waiting: AtomicUsize,
    sink: Arc<dyn EventSink>,
    settings: CoordinatorSettings,
}

impl PollCoordinator {
    pub fn new(settings: CoordinatorSettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                watermark: Utc::now(),
                pollers: Vec::new(),
            }),
            waiting: AtomicUsize::new(0),
            sink,
            settings,
        }
    }

    /// Add a poller. Pollers run in registration order every cycle.
    pub fn register<P: SourcePoller + 'static>(&mut self, poller: P) {
        info!("Registered poller: {}", SourcePoller::name(&poller));
        self.state.get_mut().pollers.push(Box::new(poller));
    }

    pub fn poller_count(&mut self) -> usize {
        self.state.get_mut().pollers.len()
    }

    pub async fn watermark(&self) -> DateTime<Utc> {
        self.state.lock().await.watermark
    }

    /// Number of change handlers currently queued on the lock.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Seed the watermark to the oldest watched mtime minus the seed
    /// look-back, then poll once without emitting so every poller's cache
    /// holds the rows that already exist. Returns the seeded watermark.
    pub async fn start(&self) -> DateTime<Utc> {
        let oldest = self
            .settings
            .paths
            .iter()
            .filter_map(|p| modified_at(p))
            .min()
            .unwrap_or_else(|| {
                warn!("No watched path has a readable mtime; seeding from now");
                Utc::now()
            });
        let seed = look_back(oldest, self.settings.seed_lookback);

        let mut state = self.state.lock().await;
        state.watermark = seed;
        info!("Seeded watermark at {}; warming caches", seed);
        let warmed = Self::run_pollers(&mut state, seed, None).await;
        debug!("Cache warm-up saw {} event(s)", warmed);
        seed
    }

    /// React to one (debounced) change notification.
    ///
    /// Blocks until the coordination lock is free. A change whose current
    /// mtime is not past the watermark is already covered and polls nothing.
    pub async fn handle_change_event(&self, event: ChangeEvent) -> PollOutcome {
        let queued = Queued::enter(&self.waiting);
        let mut state = self.state.lock().await;
        drop(queued);

        if event.current_mod_time <= state.watermark {
            debug!(
                "Change on {} at {} already covered by watermark {}",
                event.path.display(),
                event.current_mod_time,
                state.watermark
            );
            return PollOutcome::Skipped;
        }

        let after = look_back(event.previous_mod_time, self.settings.lookback);
        state.watermark = after;
        let emitted = Self::run_pollers(&mut state, after, Some(self.sink.as_ref())).await;
        for poller in state.pollers.iter_mut() {
            poller.trim_caches();
        }
        debug!("Poll after {} emitted {} event(s)", after, emitted);

        if self.waiting() > 0 {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        PollOutcome::Polled { after, emitted }
    }

    /// Run every poller for rows after `after`, forwarding results to the
    /// sink when `emit` is set. Returns the number of results emitted.
    pub async fn poll(&self, after: DateTime<Utc>, emit: bool) -> usize {
        let mut state = self.state.lock().await;
        let sink = emit.then(|| self.sink.as_ref());
        Self::run_pollers(&mut state, after, sink).await
    }

    async fn run_pollers(
        state: &mut CoordinatorState,
        after: DateTime<Utc>,
        sink: Option<&dyn EventSink>,
    ) -> usize {
        let mut emitted = 0;
        for poller in state.pollers.iter_mut() {
            match poller.poll(after).await {
                Ok(results) => {
                    let Some(sink) = sink else { continue };
                    for result in results {
                        sink.emit(result);
                        emitted += 1;
                    }
                }
                Err(e) => {
                    warn!("Poller {} failed; no events from it this cycle: {}", poller.name(), e);
                }
            }
        }
        emitted
    }
}

fn look_back(from: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    from.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

//! Integration tests for the poll coordinator

use chatsync_daemon::listener::{
    ChangeEvent, CoordinatorSettings, DebounceGate, PollCoordinator, PollOutcome,
};
use chatsync_daemon::poller::{DedupCache, EventType, PollResult, PollerError, SourcePoller};
use chatsync_daemon::sink::EventSink;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_test::traced_test;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

fn ms(offset: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(offset)
}

/// Rows known in advance: (id, modification time)
type Rows = Arc<Mutex<Vec<(String, DateTime<Utc>)>>>;

/// Poller over an in-memory row list that records how it was driven
struct SyntheticPoller {
    name: &'static str,
    rows: Rows,
    cache: DedupCache,
    calls: Arc<Mutex<Vec<DateTime<Utc>>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    trims: Arc<AtomicUsize>,
    delay: Option<Duration>,
    fail: bool,
}

impl SyntheticPoller {
    fn new(name: &'static str, rows: Rows) -> Self {
        Self {
            name,
            rows,
            cache: DedupCache::new(100),
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            trims: Arc::new(AtomicUsize::new(0)),
            delay: None,
            fail: false,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = DedupCache::new(capacity);
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl SourcePoller for SyntheticPoller {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn poll(&mut self, after: DateTime<Utc>) -> Result<Vec<PollResult>, PollerError> {
        self.calls.lock().unwrap().push(after);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(PollerError::Other {
                message: "database is locked".to_string(),
            });
        }

        let rows = self.rows.lock().unwrap().clone();
        Ok(rows
            .into_iter()
            .filter(|(_, modified)| *modified > after)
            .filter(|(id, _)| self.cache.insert(id.clone()))
            .map(|(id, _)| PollResult::new(EventType::NewEntry, json!({ "id": id })))
            .collect())
    }

    fn trim_caches(&mut self) {
        self.trims.fetch_add(1, Ordering::SeqCst);
        self.cache.trim();
    }
}

#[derive(Default)]
struct RecordingSink {
    results: Mutex<Vec<PollResult>>,
}

impl RecordingSink {
    fn ids(&self) -> Vec<String> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.payload["id"].as_str().unwrap().to_string())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, result: PollResult) {
        self.results.lock().unwrap().push(result);
    }
}

/// A watched file whose mtime is pinned to `mtime`
fn watched_file(mtime: DateTime<Utc>) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    let file = std::fs::File::create(&path).unwrap();
    file.set_modified(mtime.into()).unwrap();
    (dir, path)
}

fn settings(path: PathBuf, settle_delay: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        paths: vec![path],
        settle_delay,
        seed_lookback: chrono::Duration::seconds(60),
        lookback: chrono::Duration::seconds(30),
    }
}

fn change(previous: DateTime<Utc>, current: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        path: PathBuf::from("chat.db"),
        previous_mod_time: previous,
        current_mod_time: current,
    }
}

#[tokio::test]
async fn test_seed_and_steady_state_window() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let poller = SyntheticPoller::new("synthetic", rows.clone());
    let calls = poller.calls.clone();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(poller);

    let seed = coordinator.start().await;
    assert_eq!(seed, ms(-60_000));
    assert_eq!(coordinator.watermark().await, ms(-60_000));

    let t1 = ms(10_000);
    let t2 = ms(11_000);
    rows.lock().unwrap().push(("inside".to_string(), t1 - chrono::Duration::milliseconds(100)));
    rows.lock().unwrap().push(("outside".to_string(), t1 - chrono::Duration::milliseconds(40_000)));

    let outcome = coordinator.handle_change_event(change(t1, t2)).await;
    let after = t1 - chrono::Duration::milliseconds(30_000);
    assert_eq!(outcome, PollOutcome::Polled { after, emitted: 1 });
    assert_eq!(sink.ids(), vec!["inside"]);
    assert_eq!(coordinator.watermark().await, after);

    // Same window again: nothing new.
    assert_eq!(coordinator.poll(after, true).await, 0);
    assert_eq!(sink.ids(), vec!["inside"]);

    assert_eq!(*calls.lock().unwrap(), vec![seed, after, after]);
}

#[tokio::test]
async fn test_warm_up_pass_does_not_emit() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::new(Mutex::new(vec![("existing".to_string(), ms(-1_000))]));
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("synthetic", rows.clone()));
    coordinator.start().await;
    assert!(sink.ids().is_empty());

    rows.lock().unwrap().push(("fresh".to_string(), ms(5_000)));
    coordinator.handle_change_event(change(ms(4_000), ms(5_000))).await;
    assert_eq!(sink.ids(), vec!["fresh"]);
}

#[tokio::test]
async fn test_stale_change_triggers_no_poll() {
    let (_dir, path) = watched_file(t0());
    let poller = SyntheticPoller::new("synthetic", Arc::default());
    let calls = poller.calls.clone();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(poller);
    coordinator.start().await;
    assert_eq!(calls.lock().unwrap().len(), 1);

    let watermark = coordinator.watermark().await;
    let outcome = coordinator
        .handle_change_event(change(watermark - chrono::Duration::seconds(5), watermark))
        .await;
    assert_eq!(outcome, PollOutcome::Skipped);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(coordinator.watermark().await, watermark);
}

#[tokio::test]
async fn test_overlapping_windows_emit_each_row_once() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("synthetic", rows.clone()));
    coordinator.start().await;

    rows.lock().unwrap().push(("a".to_string(), ms(1_000)));
    coordinator.handle_change_event(change(ms(900), ms(1_000))).await;
    rows.lock().unwrap().push(("b".to_string(), ms(2_000)));
    coordinator.handle_change_event(change(ms(1_000), ms(2_000))).await;
    coordinator.handle_change_event(change(ms(2_000), ms(3_000))).await;

    assert_eq!(sink.ids(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_every_mutation_is_emitted() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("synthetic", rows.clone()));
    coordinator.start().await;

    // Mutations every 200ms; only every third change notification survives
    // debouncing, carrying the mtimes of the last write in its burst.
    let mut expected = Vec::new();
    let mut previous = t0();
    for i in 1..=12 {
        let at = ms(i * 200);
        let id = format!("row-{i}");
        rows.lock().unwrap().push((id.clone(), at));
        expected.push(id);
        if i % 3 == 0 {
            coordinator.handle_change_event(change(previous, at)).await;
        }
        previous = at;
    }

    assert_eq!(sink.ids(), expected);
}

#[tokio::test]
async fn test_results_follow_registration_order() {
    let (_dir, path) = watched_file(t0());
    let first_rows: Rows = Arc::default();
    let second_rows: Rows = Arc::default();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("first", first_rows.clone()));
    coordinator.register(SyntheticPoller::new("second", second_rows.clone()));
    assert_eq!(coordinator.poller_count(), 2);
    coordinator.start().await;

    second_rows.lock().unwrap().push(("second-early".to_string(), ms(1_000)));
    first_rows.lock().unwrap().push(("first-late".to_string(), ms(2_000)));
    first_rows.lock().unwrap().push(("first-later".to_string(), ms(2_500)));
    coordinator.handle_change_event(change(ms(2_000), ms(2_500))).await;

    assert_eq!(sink.ids(), vec!["first-late", "first-later", "second-early"]);
}

#[tokio::test]
#[traced_test]
async fn test_failing_poller_is_isolated() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("broken", Arc::default()).failing());
    coordinator.register(SyntheticPoller::new("healthy", rows.clone()));
    coordinator.start().await;

    rows.lock().unwrap().push(("ok".to_string(), ms(1_000)));
    let outcome = coordinator.handle_change_event(change(ms(900), ms(1_000))).await;

    assert!(matches!(outcome, PollOutcome::Polled { emitted: 1, .. }));
    assert_eq!(sink.ids(), vec!["ok"]);
    assert!(logs_contain("Poller broken failed"));

    // The lock was released: the next cycle still runs.
    rows.lock().unwrap().push(("ok-2".to_string(), ms(2_000)));
    coordinator.handle_change_event(change(ms(1_000), ms(2_000))).await;
    assert_eq!(sink.ids(), vec!["ok", "ok-2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_poll_at_a_time() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let poller =
        SyntheticPoller::new("slow", rows.clone()).with_delay(Duration::from_millis(10));
    let (calls, max_active) = (poller.calls.clone(), poller.max_active.clone());
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator =
        PollCoordinator::new(settings(path, Duration::from_millis(1)), sink.clone());
    coordinator.register(poller);
    let coordinator = Arc::new(coordinator);
    coordinator.start().await;

    let mut handles = Vec::new();
    for i in 1..=8 {
        rows.lock().unwrap().push((format!("row-{i}"), ms(i * 100)));
        let coordinator = Arc::clone(&coordinator);
        let event = change(ms(i * 100 - 50), ms(i * 100));
        handles.push(tokio::spawn(async move {
            coordinator.handle_change_event(event).await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(calls.lock().unwrap().len() <= 9);
    assert_eq!(coordinator.waiting(), 0);

    let mut ids = sink.ids();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), sink.ids().len());
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_only_under_contention() {
    let (_dir, path) = watched_file(t0());
    let settle = Duration::from_millis(100);
    let poller = SyntheticPoller::new("synthetic", Arc::default())
        .with_delay(Duration::from_millis(10));
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, settle), sink.clone());
    coordinator.register(poller);
    let coordinator = Arc::new(coordinator);
    coordinator.start().await;

    let started = tokio::time::Instant::now();
    coordinator.handle_change_event(change(ms(1_000), ms(2_000))).await;
    assert!(started.elapsed() < settle);

    let started = tokio::time::Instant::now();
    let first = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_change_event(change(ms(2_000), ms(3_000))).await }
    });
    tokio::task::yield_now().await;
    let second = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_change_event(change(ms(3_000), ms(4_000))).await }
    });

    first.await.unwrap();
    second.await.unwrap();
    // Two 10ms polls plus one settle delay for the queued handler.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert!(started.elapsed() < Duration::from_millis(220));
}

#[tokio::test]
async fn test_caches_trimmed_once_per_emitting_cycle() {
    let (_dir, path) = watched_file(t0());
    let first = SyntheticPoller::new("first", Arc::default());
    let second = SyntheticPoller::new("second", Arc::default());
    let (first_trims, second_trims) = (first.trims.clone(), second.trims.clone());
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(first);
    coordinator.register(second);

    coordinator.start().await;
    assert_eq!(first_trims.load(Ordering::SeqCst), 0);
    assert_eq!(second_trims.load(Ordering::SeqCst), 0);

    let outcome = coordinator.handle_change_event(change(ms(900), ms(1_000))).await;
    assert!(matches!(outcome, PollOutcome::Polled { .. }));
    assert_eq!(first_trims.load(Ordering::SeqCst), 1);
    assert_eq!(second_trims.load(Ordering::SeqCst), 1);

    let watermark = coordinator.watermark().await;
    let outcome = coordinator
        .handle_change_event(change(watermark - chrono::Duration::seconds(1), watermark))
        .await;
    assert_eq!(outcome, PollOutcome::Skipped);
    assert_eq!(first_trims.load(Ordering::SeqCst), 1);
    assert_eq!(second_trims.load(Ordering::SeqCst), 1);

    coordinator.handle_change_event(change(ms(1_000), ms(2_000))).await;
    assert_eq!(first_trims.load(Ordering::SeqCst), 2);
    assert_eq!(second_trims.load(Ordering::SeqCst), 2);

    // Ad hoc polls leave the caches alone.
    coordinator.poll(ms(0), true).await;
    assert_eq!(first_trims.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_waiter_is_not_counted() {
    let (_dir, path) = watched_file(t0());
    let settle = Duration::from_millis(100);
    let poll_time = Duration::from_millis(500);
    let poller = SyntheticPoller::new("slow", Arc::default()).with_delay(poll_time);
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, settle), sink.clone());
    coordinator.register(poller);
    let coordinator = Arc::new(coordinator);
    coordinator.start().await;

    let started = tokio::time::Instant::now();
    let running = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_change_event(change(ms(1_000), ms(2_000))).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle_change_event(change(ms(2_000), ms(3_000))).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(coordinator.waiting(), 1);

    queued.abort();
    assert!(queued.await.unwrap_err().is_cancelled());
    assert_eq!(coordinator.waiting(), 0);

    // Nobody is queued any more, so the running cycle skips the settle delay.
    running.await.unwrap();
    assert!(started.elapsed() < poll_time + settle);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_writes_through_debounce_are_all_emitted() {
    let (_dir, path) = watched_file(t0());
    let rows: Rows = Arc::default();
    let sink = Arc::new(RecordingSink::default());

    let mut coordinator = PollCoordinator::new(settings(path, Duration::ZERO), sink.clone());
    coordinator.register(SyntheticPoller::new("synthetic", rows.clone()).with_cache_capacity(1_000));
    let coordinator = Arc::new(coordinator);
    coordinator.start().await;

    let gate = DebounceGate::new(Duration::from_millis(500), {
        let coordinator = Arc::clone(&coordinator);
        move |event: ChangeEvent| {
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.handle_change_event(event).await }
        }
    });

    // 40s of writes 200ms apart, longer than the 30s look-back.
    let mut expected = Vec::new();
    let mut handlers = Vec::new();
    let mut previous = t0();
    for i in 1..=200 {
        let at = ms(i * 200);
        let id = format!("row-{i}");
        rows.lock().unwrap().push((id.clone(), at));
        expected.push(id);
        handlers.push(tokio::spawn(gate.call("chat.db", change(previous, at))));
        previous = at;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    for handler in handlers {
        assert!(handler.await.unwrap().is_some());
    }

    assert_eq!(sink.ids(), expected);
}

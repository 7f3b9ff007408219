//! File change notifier for the chat database files.
//!
//! Watches the parent directory of every configured path (non-recursively, so
//! a `-wal` file created after startup is still seen) and turns raw notify
//! events into [`ChangeEvent`]s carrying the previous and current
//! modification time of the file that changed. Events that leave the mtime
//! unchanged are dropped here.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A watched file's modification time moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub previous_mod_time: DateTime<Utc>,
    pub current_mod_time: DateTime<Utc>,
}

/// Output of the notifier
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Changed(ChangeEvent),
    /// The underlying watcher reported an error. Not fatal.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create file system watcher: {0}")]
    Create(#[from] notify::Error),

    #[error("none of the {0} configured path(s) could be watched")]
    NoPaths(usize),

    #[error("notifier already started")]
    AlreadyStarted,
}

/// Modification time of `path`, if it exists and the platform reports one.
pub fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Absolute form of a watched path, resolved through its parent directory so
/// it matches the paths notify reports even if the file does not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = std::fs::canonicalize(&parent).unwrap_or(parent);
    match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    }
}

/// Record `current` for `path` and report a change if it differs from the
/// last known mtime. A file seen for the first time reports its own mtime as
/// the previous one.
fn detect_change(
    known: &mut HashMap<PathBuf, Option<DateTime<Utc>>>,
    path: &Path,
    current: Option<DateTime<Utc>>,
) -> Option<ChangeEvent> {
    let slot = known.get_mut(path)?;
    let current_mod_time = current?;
    if *slot == Some(current_mod_time) {
        return None;
    }
    let previous_mod_time = slot.unwrap_or(current_mod_time);
    *slot = Some(current_mod_time);
    Some(ChangeEvent {
        path: path.to_path_buf(),
        previous_mod_time,
        current_mod_time,
    })
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

/// Watches a set of files as one logical change stream.
pub struct ChangeNotifier {
    paths: Vec<PathBuf>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl ChangeNotifier {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            cancel: None,
            task: None,
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| !c.is_cancelled())
    }

    /// Start watching. Returns the number of directories subscribed to.
    ///
    /// A directory that cannot be watched is logged and skipped; only a
    /// notifier with nothing at all to watch is an error.
    pub fn start(&mut self, event_tx: mpsc::Sender<WatchEvent>) -> Result<usize, WatchError> {
        if self.is_running() {
            return Err(WatchError::AlreadyStarted);
        }

        let (tx, rx) = channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Err(e) = tx.send(res) {
                    error!("Failed to forward file system event: {}", e);
                }
            })?;

        let mut known: HashMap<PathBuf, Option<DateTime<Utc>>> = HashMap::new();
        let mut dirs = BTreeSet::new();
        for path in &self.paths {
            let normalized = normalize(path);
            if let Some(parent) = normalized.parent() {
                dirs.insert(parent.to_path_buf());
            }
            let mtime = modified_at(&normalized);
            known.insert(normalized, mtime);
        }

        let mut watched = 0;
        for dir in &dirs {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!("Watching {} for changes", dir.display());
                    watched += 1;
                }
                Err(e) => warn!("Cannot watch {}: {}", dir.display(), e),
            }
        }
        if watched == 0 {
            return Err(WatchError::NoPaths(self.paths.len()));
        }

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            // Dropping the watcher at the end of this closure removes the
            // OS-level subscriptions.
            let _watcher = watcher;
            loop {
                if cancel_clone.is_cancelled() {
                    info!("Change notifier stopped");
                    break;
                }

                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(event)) => {
                        if !is_relevant(&event.kind) {
                            continue;
                        }
                        for path in &event.paths {
                            let Some(change) = detect_change(&mut known, path, modified_at(path))
                            else {
                                continue;
                            };
                            debug!(
                                "Change on {}: {} -> {}",
                                change.path.display(),
                                change.previous_mod_time,
                                change.current_mod_time
                            );
                            if event_tx.blocking_send(WatchEvent::Changed(change)).is_err() {
                                warn!("Change receiver dropped; stopping notifier");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("File system watcher error: {}", e);
                        if event_tx.blocking_send(WatchEvent::Error(e.to_string())).is_err() {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("Watcher channel disconnected");
                        break;
                    }
                }
            }
        });

        self.cancel = Some(cancel);
        self.task = Some(task);
        Ok(watched)
    }

    /// Stop watching and wait for the notifier thread to release its
    /// subscriptions.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Change notifier task panicked: {}", e);
            }
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

//! Keyed trailing-edge debounce gate.
//!
//! [`DebounceGate::call`] schedules the wrapped handler to run `wait` after
//! the first call of a batch. A call that arrives while the batch is still
//! pending replaces its arguments and joins it; it neither starts a second
//! timer nor moves the deadline, so a steady stream of calls still executes
//! once per `wait`. Every caller in a batch resolves with the outcome of the
//! single execution, which sees the most recent arguments.
//!
//! Distinct keys are independent. Once [`DebounceGate::cancel`] has been
//! called, pending batches are dropped without executing and their callers
//! resolve to `None`. An execution that has already started is left to finish.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Handler<A, R> = Arc<dyn Fn(A) -> Pin<Box<dyn Future<Output = R> + Send>> + Send + Sync>;

struct PendingCall<A, R> {
    args: A,
    waiters: Vec<oneshot::Sender<R>>,
}

type PendingMap<A, R> = Arc<Mutex<HashMap<String, PendingCall<A, R>>>>;

pub struct DebounceGate<A, R> {
    wait: Duration,
    handler: Handler<A, R>,
    pending: PendingMap<A, R>,
    cancel: CancellationToken,
}

impl<A, R> DebounceGate<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F, Fut>(wait: Duration, handler: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            wait,
            handler: Arc::new(move |args| -> Pin<Box<dyn Future<Output = R> + Send>> {
                Box::pin(handler(args))
            }),
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Submit `args` under `key`. The returned future resolves with the
    /// outcome of the batch's execution, or `None` if the gate was cancelled
    /// first. Must be called from within a tokio runtime.
    pub fn call(
        &self,
        key: &str,
        args: A,
    ) -> impl Future<Output = Option<R>> + Send + use<A, R> {
        let (tx, rx) = oneshot::channel();
        if !self.cancel.is_cancelled() {
            self.schedule(key.to_string(), args, tx);
        }
        async move { rx.await.ok() }
    }

    fn schedule(&self, key: String, args: A, waiter: oneshot::Sender<R>) {
        let mut pending = lock(&self.pending);
        match pending.get_mut(&key) {
            Some(call) => {
                debug!("Debounce {key}: superseding pending call");
                call.args = args;
                call.waiters.push(waiter);
            }
            None => {
                pending.insert(
                    key.clone(),
                    PendingCall {
                        args,
                        waiters: vec![waiter],
                    },
                );
                tokio::spawn(fire_at(
                    key,
                    Instant::now() + self.wait,
                    Arc::clone(&self.pending),
                    Arc::clone(&self.handler),
                    self.cancel.clone(),
                ));
            }
        }
    }

    /// Drop every pending batch and refuse new calls.
    pub fn cancel(&self) {
        self.cancel.cancel();
        lock(&self.pending).clear();
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

impl<A, R> Drop for DebounceGate<A, R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<A, R>(pending: &PendingMap<A, R>) -> MutexGuard<'_, HashMap<String, PendingCall<A, R>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Timer task for one batch. Sleeps until the deadline set by the batch's
/// first call, then runs the handler once and fans the outcome out to every
/// waiter.
async fn fire_at<A, R>(
    key: String,
    deadline: Instant,
    pending: PendingMap<A, R>,
    handler: Handler<A, R>,
    cancel: CancellationToken,
) where
    R: Clone,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            lock(&pending).remove(&key);
            return;
        }
        _ = tokio::time::sleep_until(deadline) => {}
    }

    let Some(call) = lock(&pending).remove(&key) else {
        return;
    };
    if cancel.is_cancelled() {
        return;
    }

    debug!("Debounce {key}: executing for {} waiter(s)", call.waiters.len());
    let outcome = handler(call.args).await;
    for waiter in call.waiters {
        let _ = waiter.send(outcome.clone());
    }
}

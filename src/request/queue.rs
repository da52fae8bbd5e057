//! Tracking queue for live retrying requests

use super::RetryingRequest;
use std::{
    fmt::Debug,
    pin::pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};
use tokio::sync::Notify;
use tracing::debug;

/// Aggregate dispatch counters shared between a queue and its requests.
///
/// Lock-free; a reader may see values mid-transition while a request task is
/// between updates.
#[derive(Default)]
pub struct Stats {
    /// Requests currently tracked and not yet terminal
    pub running: AtomicUsize,
    /// Retries scheduled across all tracked requests
    pub retries: AtomicUsize,
    /// Requests that delivered a successful outcome
    pub completed: AtomicUsize,
    /// Requests that delivered a permanent failure or exhausted their retries
    pub failed: AtomicUsize,
}

impl Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request queue stats: running: {}, retries: {}, completed: {}, failed: {}",
            self.running.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        )
    }
}

/// Tracks in-flight [`RetryingRequest`]s.
///
/// Requests submitted through the queue remove themselves at terminal
/// completion, so the queue always reflects what is actually outstanding.
pub struct RequestQueue<R> {
    requests: Mutex<Vec<Arc<RetryingRequest<R>>>>,
    stats: Stats,
    changed: Notify,
}

impl<R: Send + 'static> RequestQueue<R> {
    /// Construct an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            stats: Stats::default(),
            changed: Notify::new(),
        })
    }

    /// Track `request` and submit its first attempt.
    pub fn submit(
        self: &Arc<Self>,
        request: Arc<RetryingRequest<R>>,
        compressed: bool,
    ) -> Arc<RetryingRequest<R>> {
        request.set_owner(Arc::downgrade(self));
        self.lock().push(request.clone());
        self.stats.running.fetch_add(1, Ordering::Relaxed);
        request.submit(compressed)
    }

    /// Called by a request at terminal completion.
    pub(super) fn remove(&self, request: &Arc<RetryingRequest<R>>, success: bool) {
        {
            let mut requests = self.lock();
            let before = requests.len();
            requests.retain(|tracked| !Arc::ptr_eq(tracked, request));
            if requests.len() == before {
                return;
            }
        }
        self.stats.running.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("{:?}", self.stats);
        self.changed.notify_waiters();
    }

    /// Number of requests still outstanding.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The queue's counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Wait until every tracked request has reached its terminal state.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<RetryingRequest<R>>>> {
        self.requests.lock().expect("request queue lock poisoned")
    }
}

//! Worker pools for delayed dispatch tasks and outbound request attempts
//!
//! Both pools run on the ambient tokio runtime. They exist so that the
//! [`Batcher`](crate::batcher::Batcher) and
//! [`RetryingRequest`](crate::request::RetryingRequest) can observe a shared
//! shutdown flag and so that delivery timers hand back cancelable handles.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
    time::Instant,
};

/// A pool that accepts delayed tasks and returns cancelable handles.
///
/// Used for batch delivery timers and retry backoff timers. After
/// [`shutdown`](ScheduledExecutor::shutdown) is called, [`schedule`]
/// returns `None` and callers are expected to no-op or complete terminally.
///
/// [`schedule`]: ScheduledExecutor::schedule
#[derive(Clone, Default)]
pub struct ScheduledExecutor {
    shut_down: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    /// Construct a new scheduled pool on the ambient runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `task` to run after `delay`. Returns `None` if the pool is shut down.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Option<ScheduledTask>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return None;
        }

        let fire_at = Instant::now() + delay;
        let claimed = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);

        let claim = claimed.clone();
        let run_flag = running.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            // A successful cancel claims the task first, so losing this race
            // means the timer stays dead.
            if claim
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            run_flag.store(true, Ordering::SeqCst);
            task.await;
            done_tx.send_replace(true);
        });

        Some(ScheduledTask {
            fire_at,
            claimed,
            running,
            done: done_rx,
            handle,
        })
    }

    /// Stop accepting new tasks. Already-armed tasks still fire.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// Whether [`shutdown`](ScheduledExecutor::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Handle to a task armed on a [`ScheduledExecutor`].
pub struct ScheduledTask {
    fire_at: Instant,
    claimed: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Time left until the task fires, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.fire_at.saturating_duration_since(Instant::now())
    }

    /// True once the task is past its fire time or has entered its body.
    ///
    /// Callers use this to leave a timer alone rather than racing it with a
    /// cancel: a ready task will run momentarily and reschedule on its own.
    pub fn is_ready_or_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.remaining().is_zero()
    }

    /// Try to cancel the task. Returns false if it already claimed its run.
    pub fn cancel(&self) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.handle.abort();
            true
        } else {
            false
        }
    }

    /// Wait until the task body has run to completion, or the task was
    /// cancelled before running.
    pub async fn wait(&self) {
        let mut done = self.done_watch();
        // wait_for errors when the sender is gone, which means the task was
        // cancelled or aborted. Either way there is nothing left to wait for.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Completion signal for this task; flips to true after the body runs,
    /// closes if the task is cancelled instead.
    pub fn done_watch(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }
}

/// A bounded pool for outbound request attempts.
///
/// At most `capacity` attempts run concurrently; excess spawns queue on the
/// internal semaphore. The cap keeps a burst of retrying requests from
/// saturating the runtime.
#[derive(Clone)]
pub struct RequestExecutor {
    semaphore: Arc<Semaphore>,
    shut_down: Arc<AtomicBool>,
}

impl RequestExecutor {
    /// Construct a pool running at most `capacity` attempts at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn an attempt on the pool. Returns `None` if the pool is shut down.
    pub fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shut_down() {
            return None;
        }
        let semaphore = self.semaphore.clone();
        Some(tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only ever waits.
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        }))
    }

    /// Stop accepting new attempts. In-flight attempts run to completion.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// Whether [`shutdown`](RequestExecutor::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_fires_after_delay() {
        let executor = ScheduledExecutor::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let task = executor
            .schedule(Duration::from_millis(500), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .expect("executor is running");

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!fired.load(Ordering::SeqCst));

        task.wait().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_prevents_run() {
        let executor = ScheduledExecutor::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let task = executor
            .schedule(Duration::from_secs(5), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .expect("executor is running");

        assert!(task.cancel());
        task.wait().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_run_returns_false() {
        let executor = ScheduledExecutor::new();
        let task = executor
            .schedule(Duration::from_millis(10), async {})
            .expect("executor is running");

        task.wait().await;
        assert!(task.is_ready_or_running());
        assert!(!task.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_or_running_tracks_remaining() {
        let executor = ScheduledExecutor::new();
        let task = executor
            .schedule(Duration::from_secs(1), std::future::pending())
            .expect("executor is running");

        assert!(!task.is_ready_or_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(task.is_ready_or_running());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_tasks() {
        let executor = ScheduledExecutor::new();
        executor.shutdown();
        assert!(executor.schedule(Duration::ZERO, async {}).is_none());

        let requests = RequestExecutor::new(4);
        requests.shutdown();
        assert!(requests.spawn(async {}).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_pool_caps_concurrency() {
        let executor = RequestExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let running = running.clone();
            let peak = peak.clone();
            let handle = executor
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .expect("executor is running");
            handles.push(handle);
        }

        for handle in handles {
            handle.await.expect("attempt completes");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

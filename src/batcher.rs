//! Time and size bounded grouping of homogeneous work items
//!
//! A [`Batcher`] accumulates items and hands them to a [`Processor`] in
//! arrival order. Delivery is triggered by reaching the group capacity, by a
//! batching delay running out, or immediately when the batcher has been idle
//! longer than the delay. Delivery timers run on a
//! [`ScheduledExecutor`](crate::executor::ScheduledExecutor).

use crate::{
    error::Error,
    executor::{ScheduledExecutor, ScheduledTask},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

/// Consumes one ordered group of batched items, e.g. a bulk document push.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    /// Process a non-empty group of at most `capacity` items in arrival order.
    ///
    /// A failed group is logged and dropped, never redelivered.
    async fn process(&self, group: Vec<T>) -> Result<(), Error>;
}

/// Accumulates items into size- or time-bounded groups for a [`Processor`].
///
/// Cloning yields another handle to the same batcher. Requires a tokio
/// runtime.
pub struct Batcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> std::fmt::Debug for Batcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher").finish_non_exhaustive()
    }
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    executor: ScheduledExecutor,
    capacity: usize,
    delay: Duration,
    processor: Box<dyn Processor<T>>,
    state: Mutex<State<T>>,
    // Signalled under the state lock after any mutation that could unblock a
    // waiter: enqueue, clear, delivery completion.
    changed: Notify,
}

struct State<T> {
    inbox: VecDeque<T>,
    scheduled: Option<ScheduledTask>,
    scheduled_delay: Duration,
    processing: bool,
    last_processed_at: Instant,
}

impl<T: Send + 'static> Batcher<T> {
    /// Construct a batcher delivering groups of up to `capacity` items after
    /// at most `delay` to `processor`.
    pub fn new(
        executor: ScheduledExecutor,
        capacity: usize,
        delay: Duration,
        processor: impl Processor<T> + 'static,
    ) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidRequest("batcher capacity must be > 0".into()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                executor,
                capacity,
                delay,
                processor: Box::new(processor),
                state: Mutex::new(State {
                    inbox: VecDeque::new(),
                    scheduled: None,
                    scheduled_delay: Duration::ZERO,
                    processing: false,
                    last_processed_at: Instant::now(),
                }),
                changed: Notify::new(),
            }),
        })
    }

    /// Append `items` to the inbox in order and arm a delivery.
    ///
    /// An empty iterator is a no-op.
    pub fn enqueue<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.inner.lock_state();
        let before = state.inbox.len();
        state.inbox.extend(items);
        if state.inbox.len() == before {
            return;
        }
        self.inner.changed.notify_waiters();
        Inner::reschedule(&self.inner, &mut state, false);
    }

    /// Number of items currently buffered.
    ///
    /// Informational only; concurrent enqueues make this stale immediately.
    pub fn count(&self) -> usize {
        self.inner.lock_state().inbox.len()
    }

    /// Deliver everything currently buffered, blocking until each delivery
    /// has completed.
    ///
    /// Items arriving while the flush runs may or may not be included.
    pub async fn flush_all(&self) {
        loop {
            let mut notified = pin!(self.inner.changed.notified());
            notified.as_mut().enable();
            let done = {
                let mut state = self.inner.lock_state();
                if state.inbox.is_empty() {
                    break;
                }
                if state.processing {
                    // A delivery is mid-flight; its completion reschedules the
                    // residue and signals `changed`.
                    None
                } else {
                    Inner::reschedule(&self.inner, &mut state, true);
                    match state.scheduled.as_ref().map(ScheduledTask::done_watch) {
                        Some(done) => Some(done),
                        // Nothing could be armed, the executor is gone.
                        None => break,
                    }
                }
            };
            match done {
                Some(mut done) => {
                    let _ = done.wait_for(|finished| *finished).await;
                }
                None => notified.await,
            }
        }
    }

    /// Cancel any armed delivery and drop every buffered item undelivered.
    ///
    /// An in-flight delivery is not interrupted; its group still completes.
    pub fn clear(&self) {
        let mut state = self.inner.lock_state();
        if let Some(task) = state.scheduled.take() {
            // A task that already fired will find an empty inbox and back off.
            task.cancel();
        }
        let dropped = state.inbox.len();
        state.inbox.clear();
        if dropped > 0 {
            debug!("cleared {dropped} buffered items without delivering");
        }
        self.inner.changed.notify_waiters();
    }

    /// Wait until the inbox is empty and no delivery is running.
    ///
    /// Items enqueued after the call begins may extend the wait.
    pub async fn wait_until_drained(&self) {
        loop {
            let mut notified = pin!(self.inner.changed.notified());
            notified.as_mut().enable();
            {
                let state = self.inner.lock_state();
                if state.inbox.is_empty() && !state.processing {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect("batcher state lock poisoned")
    }

    /// Arm (or re-arm) the delivery task for a non-empty inbox.
    ///
    /// Delay selection: immediate when forced, when the inbox has reached
    /// capacity, or when the batcher has already been idle longer than the
    /// batching delay; otherwise the full delay, to group more arrivals.
    fn reschedule(inner: &Arc<Self>, state: &mut State<T>, immediate: bool) {
        if state.inbox.is_empty() {
            return;
        }

        let target = if immediate
            || state.inbox.len() >= inner.capacity
            || state.last_processed_at.elapsed() >= inner.delay
        {
            Duration::ZERO
        } else {
            inner.delay
        };

        if let Some(task) = &state.scheduled {
            // A task about to fire (or already firing) processes soon and
            // reschedules afterwards; leave it alone.
            if task.is_ready_or_running() {
                return;
            }
            if state.scheduled_delay <= target {
                return;
            }
            if !task.cancel() {
                return;
            }
        }

        let batcher = inner.clone();
        match inner
            .executor
            .schedule(target, async move { Self::deliver(batcher).await })
        {
            Some(task) => {
                state.scheduled = Some(task);
                state.scheduled_delay = target;
            }
            None => {
                state.scheduled = None;
                debug!("scheduled executor is shut down, leaving items buffered");
            }
        }
    }

    /// Body of the armed delivery task.
    async fn deliver(inner: Arc<Self>) {
        let group: Vec<T> = {
            let mut state = inner.lock_state();
            state.scheduled = None;
            // Another delivery is mid-flight; it reschedules the residue when
            // it completes, which keeps groups in arming order.
            if state.processing {
                return;
            }
            let take = inner.capacity.min(state.inbox.len());
            if take == 0 {
                inner.changed.notify_waiters();
                return;
            }
            state.processing = true;
            state.inbox.drain(..take).collect()
        };

        if let Err(err) = inner.processor.process(group).await {
            warn!("batch processor failed: {err}");
        }

        let mut state = inner.lock_state();
        state.processing = false;
        state.last_processed_at = Instant::now();
        if !state.inbox.is_empty() {
            Self::reschedule(&inner, &mut state, true);
        }
        inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every delivered group together with its virtual arrival time.
    struct Recording {
        groups: Mutex<Vec<(Instant, Vec<u32>)>>,
        process_delay: Duration,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(process_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                groups: Mutex::new(Vec::new()),
                process_delay,
            })
        }

        fn groups(&self) -> Vec<Vec<u32>> {
            self.groups
                .lock()
                .unwrap()
                .iter()
                .map(|(_, g)| g.clone())
                .collect()
        }

        fn delivered_at(&self, index: usize) -> Instant {
            self.groups.lock().unwrap()[index].0
        }
    }

    #[async_trait]
    impl Processor<u32> for Arc<Recording> {
        async fn process(&self, group: Vec<u32>) -> Result<(), Error> {
            if !self.process_delay.is_zero() {
                tokio::time::sleep(self.process_delay).await;
            }
            self.groups.lock().unwrap().push((Instant::now(), group));
            Ok(())
        }
    }

    fn batcher(capacity: usize, delay: Duration, recording: &Arc<Recording>) -> Batcher<u32> {
        Batcher::new(
            ScheduledExecutor::new(),
            capacity,
            delay,
            recording.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let recording = Recording::new();
        let result = Batcher::new(
            ScheduledExecutor::new(),
            0,
            Duration::from_millis(500),
            recording,
        );
        assert_eq!(result.unwrap_err(), Error::InvalidRequest(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_catch_up_after_idle() {
        let recording = Recording::new();
        let batcher = batcher(10, Duration::from_millis(500), &recording);

        // Idle longer than the batching delay, then a single arrival.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let enqueued_at = Instant::now();
        batcher.enqueue([7]);
        batcher.wait_until_drained().await;

        assert_eq!(recording.groups(), vec![vec![7]]);
        assert!(recording.delivered_at(0) - enqueued_at <= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_arrivals_within_delay() {
        let recording = Recording::new();
        let batcher = batcher(10, Duration::from_millis(500), &recording);

        // An initial delivery moves last_processed_at to "now" so the
        // following arrivals actually coalesce.
        batcher.enqueue(0..10);
        batcher.wait_until_drained().await;

        let start = Instant::now();
        batcher.enqueue([100, 101, 102]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        batcher.enqueue([103, 104]);
        batcher.wait_until_drained().await;

        let groups = recording.groups();
        assert_eq!(groups[1], vec![100, 101, 102, 103, 104]);
        let delivered = recording.delivered_at(1) - start;
        assert!(delivered >= Duration::from_millis(500));
        assert!(delivered <= Duration::from_millis(520));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_splits_into_capacity_groups() {
        let recording = Recording::new();
        let batcher = batcher(3, Duration::from_millis(500), &recording);

        batcher.enqueue(0..7);
        batcher.flush_all().await;

        assert_eq!(
            recording.groups(),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
        assert_eq!(batcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_capacity_is_one_immediate_group() {
        let recording = Recording::new();
        let batcher = batcher(5, Duration::from_secs(5), &recording);

        let start = Instant::now();
        batcher.enqueue(0..5);
        batcher.wait_until_drained().await;

        assert_eq!(recording.groups(), vec![vec![0, 1, 2, 3, 4]]);
        assert!(recording.delivered_at(0) - start <= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn twice_capacity_delivers_two_back_to_back_groups() {
        let recording = Recording::new();
        let batcher = batcher(4, Duration::from_secs(5), &recording);

        batcher.enqueue(0..8);
        batcher.wait_until_drained().await;

        assert_eq!(
            recording.groups(),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]
        );
        // The second group fires immediately after the first completes.
        assert!(
            recording.delivered_at(1) - recording.delivered_at(0) <= Duration::from_millis(20)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn order_is_preserved_across_arbitrary_splits() {
        let recording = Recording::new();
        let batcher = batcher(4, Duration::from_millis(100), &recording);

        let mut expected = Vec::new();
        let mut next = 0..;
        for split in [3usize, 1, 6, 2, 5] {
            let chunk: Vec<u32> = next.by_ref().take(split).collect();
            expected.extend(chunk.clone());
            batcher.enqueue(chunk);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        batcher.flush_all().await;

        let flat: Vec<u32> = recording.groups().into_iter().flatten().collect();
        assert_eq!(flat, expected);
        for group in recording.groups() {
            assert!(!group.is_empty());
            assert!(group.len() <= 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_pending_items() {
        let recording = Recording::new();
        let batcher = batcher(10, Duration::from_millis(500), &recording);

        // A first delivery so the next enqueue is not treated as idle
        // catch-up and stays armed with the full delay.
        batcher.enqueue(0..10);
        batcher.wait_until_drained().await;

        batcher.enqueue([1, 2, 3]);
        batcher.clear();
        assert_eq!(batcher.count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recording.groups().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_does_not_interrupt_inflight_group() {
        let recording = Recording::with_delay(Duration::from_millis(200));
        let batcher = batcher(3, Duration::from_millis(500), &recording);

        batcher.enqueue(0..3);
        // Let the delivery start, then clear while the processor runs.
        tokio::time::sleep(Duration::from_millis(50)).await;
        batcher.enqueue([90, 91]);
        batcher.clear();
        batcher.wait_until_drained().await;

        assert_eq!(recording.groups(), vec![vec![0, 1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_errors_do_not_redeliver() {
        struct Failing {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Processor<u32> for Arc<Failing> {
            async fn process(&self, _group: Vec<u32>) -> Result<(), Error> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("boom".into()))
            }
        }

        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let batcher = Batcher::new(
            ScheduledExecutor::new(),
            10,
            Duration::from_millis(100),
            failing.clone(),
        )
        .unwrap();

        batcher.enqueue(0..10);
        batcher.wait_until_drained().await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_executor_buffers_silently() {
        let recording = Recording::new();
        let executor = ScheduledExecutor::new();
        let batcher = Batcher::new(
            executor.clone(),
            10,
            Duration::from_millis(100),
            recording.clone(),
        )
        .unwrap();

        executor.shutdown();
        batcher.enqueue([1, 2, 3]);
        assert_eq!(batcher.count(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(recording.groups().is_empty());

        // flush_all cannot arm anything either; it must return, not hang.
        batcher.flush_all().await;
        assert_eq!(batcher.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_enqueue_is_a_noop() {
        let recording = Recording::new();
        let batcher = batcher(10, Duration::from_millis(100), &recording);

        batcher.enqueue(std::iter::empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(recording.groups().is_empty());
        assert_eq!(batcher.count(), 0);
    }
}

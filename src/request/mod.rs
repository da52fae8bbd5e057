//! Single-shot outbound operations with classified-error retry
//!
//! A [`RetryingRequest`] performs one remote operation through a
//! [`Transport`], retries transient failures with exponential backoff, and
//! delivers exactly one terminal outcome to its completion callback. Backoff
//! timers run on a [`ScheduledExecutor`], attempts on a [`RequestExecutor`].

pub mod body;
pub mod queue;
pub mod transport;

use self::{
    body::Body,
    queue::RequestQueue,
    transport::{Attempt, AttemptOutcome, Authenticator, Transport},
};
use crate::{
    error::Error,
    executor::{RequestExecutor, ScheduledExecutor, ScheduledTask},
};
use http::{HeaderMap, Method};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, warn};
use url::Url;

/// Retries allowed beyond the first attempt.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for the exponential backoff between attempts.
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(4);

/// Selects how the outbound request is built by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Body is an opaque value serialized by the transport
    Simple,
    /// Body is a prebuilt multipart entity, streamed out directly
    MultipartUpload,
    /// Response is a multipart payload surfaced through the transport
    MultipartDownload,
}

type Completion<R> = Box<dyn FnOnce(AttemptOutcome<R>) + Send>;
type PreCompletionHook<R> = Box<dyn Fn(&AttemptOutcome<R>) + Send + Sync>;

/// A single outbound operation with retry, in-flight tracking and cooperative
/// cancellation.
///
/// The completion callback fires exactly once per request lifetime, with the
/// outcome of the last attempt. Use behind [`Arc`]; requires a tokio runtime.
pub struct RetryingRequest<R> {
    kind: RequestKind,
    request_executor: RequestExecutor,
    scheduled_executor: ScheduledExecutor,
    transport: Arc<dyn Transport<R>>,
    method: Method,
    url: Url,
    body: Body,
    headers: HeaderMap,
    max_retries: u32,
    base_retry_delay: Duration,
    authenticator: Option<Box<dyn Authenticator>>,
    pre_completion: Option<PreCompletionHook<R>>,
    compressed: AtomicBool,
    retry_count: AtomicU32,
    completed: AtomicBool,
    completion: Mutex<Option<Completion<R>>>,
    // Most recent attempt outcome, latched while a retry is pending and
    // released at terminal completion.
    last_outcome: Mutex<Option<AttemptOutcome<R>>>,
    retry_timer: Mutex<Option<ScheduledTask>>,
    attempts_tx: Mutex<Option<UnboundedSender<JoinHandle<()>>>>,
    attempts_rx: tokio::sync::Mutex<UnboundedReceiver<JoinHandle<()>>>,
    owner: Mutex<Option<Weak<RequestQueue<R>>>>,
}

impl<R> std::fmt::Debug for RetryingRequest<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingRequest").finish_non_exhaustive()
    }
}

impl<R: Send + 'static> RetryingRequest<R> {
    /// Construct a request. Descriptors are validated here; building an
    /// invalid combination (e.g. a multipart upload over GET) fails
    /// immediately rather than on first submit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: RequestKind,
        request_executor: RequestExecutor,
        scheduled_executor: ScheduledExecutor,
        transport: Arc<dyn Transport<R>>,
        method: Method,
        url: Url,
        body: Body,
        headers: HeaderMap,
        on_complete: impl FnOnce(AttemptOutcome<R>) + Send + 'static,
    ) -> Result<Self, Error> {
        match kind {
            RequestKind::MultipartUpload => {
                if !matches!(body, Body::Multipart(_)) {
                    return Err(Error::InvalidRequest(
                        "multipart upload requires a multipart body".into(),
                    ));
                }
                if method != Method::PUT && method != Method::POST {
                    return Err(Error::InvalidRequest(
                        "multipart upload requires PUT or POST".into(),
                    ));
                }
            }
            RequestKind::Simple | RequestKind::MultipartDownload => {
                if matches!(body, Body::Multipart(_)) {
                    return Err(Error::InvalidRequest(
                        "multipart bodies are only valid for multipart uploads".into(),
                    ));
                }
            }
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported url scheme {}",
                url.scheme()
            )));
        }

        let (attempts_tx, attempts_rx) = unbounded_channel();
        Ok(Self {
            kind,
            request_executor,
            scheduled_executor,
            transport,
            method,
            url,
            body,
            headers,
            max_retries: MAX_RETRIES,
            base_retry_delay: BASE_RETRY_DELAY,
            authenticator: None,
            pre_completion: None,
            compressed: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            completion: Mutex::new(Some(Box::new(on_complete))),
            last_outcome: Mutex::new(None),
            retry_timer: Mutex::new(None),
            attempts_tx: Mutex::new(Some(attempts_tx)),
            attempts_rx: tokio::sync::Mutex::new(attempts_rx),
            owner: Mutex::new(None),
        })
    }

    /// Attach an authenticator applied to every attempt.
    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Attach a hook observing every attempt outcome before the retry
    /// decision runs.
    pub fn with_pre_completion(
        mut self,
        hook: impl Fn(&AttemptOutcome<R>) + Send + Sync + 'static,
    ) -> Self {
        self.pre_completion = Some(Box::new(hook));
        self
    }

    /// Override the default retry policy.
    pub fn with_retry_policy(mut self, max_retries: u32, base_retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_retry_delay = base_retry_delay;
        self
    }

    /// Submit the first attempt, optionally asking the transport to compress
    /// the request body. Returns the same handle for chaining into
    /// [`wait`](RetryingRequest::wait).
    pub fn submit(self: &Arc<Self>, compressed: bool) -> Arc<Self> {
        self.compressed.store(compressed, Ordering::SeqCst);
        self.spawn_attempt();
        self.clone()
    }

    /// Cancel any pending retry. Always returns false: an in-flight attempt
    /// is never interrupted, and the completion callback still fires exactly
    /// once, with whatever outcome is already latched or about to arrive.
    pub fn cancel(self: &Arc<Self>, _interrupt: bool) -> bool {
        let timer = self.lock(&self.retry_timer).take();
        if let Some(timer) = timer {
            if timer.cancel() {
                // No attempt in flight and no retry coming; deliver the
                // latched outcome so the request still terminates.
                let latched = self.lock(&self.last_outcome).take();
                if let Some(outcome) = latched {
                    self.complete(outcome);
                }
            }
        }
        false
    }

    /// Wait until a terminal outcome has been delivered or every attempt slot
    /// has been consumed.
    ///
    /// Results surface exclusively through the completion callback.
    pub async fn wait(&self) {
        let mut receiver = self.attempts_rx.lock().await;
        let mut drained = 0;
        while !self.is_completed() && drained <= self.max_retries {
            match receiver.recv().await {
                Some(handle) => {
                    handle.await.ok();
                    drained += 1;
                }
                // Channel closed: terminal state latched.
                None => break,
            }
        }
    }

    /// [`wait`](RetryingRequest::wait) with a timeout. Returns false if the
    /// timeout elapsed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Whether the terminal outcome has been delivered.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Retries consumed so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_owner(&self, owner: Weak<RequestQueue<R>>) {
        *self.lock(&self.owner) = Some(owner);
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().expect("request state lock poisoned")
    }

    fn owner_queue(&self) -> Option<Arc<RequestQueue<R>>> {
        self.lock(&self.owner).as_ref().and_then(Weak::upgrade)
    }

    /// Build a fresh attempt from the descriptors and hand it to the request
    /// pool. Called for the first submit and again by each retry timer.
    fn spawn_attempt(self: &Arc<Self>) {
        let attempt = Attempt {
            kind: self.kind,
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            compressed: self.compressed.load(Ordering::SeqCst),
        };

        let this = self.clone();
        let spawned = self.request_executor.spawn(async move {
            let mut attempt = attempt;
            if let Some(authenticator) = &this.authenticator {
                if let Err(err) = authenticator.authenticate(&mut attempt).await {
                    // Authentication failures are permanent.
                    this.on_attempt_complete(AttemptOutcome::failure(None, err));
                    return;
                }
            }
            let outcome = this.transport.execute(attempt).await;
            this.on_attempt_complete(outcome);
        });

        match spawned {
            Some(handle) => {
                if let Some(sender) = &*self.lock(&self.attempts_tx) {
                    sender.send(handle).ok();
                }
            }
            None => {
                debug!("request executor is shut down, completing {}", self.url);
                let latched = self.lock(&self.last_outcome).take();
                let outcome = latched
                    .unwrap_or_else(|| AttemptOutcome::failure(None, Error::ExecutorShutdown));
                self.complete(outcome);
            }
        }
    }

    /// The retry decision, run on the attempt's task after the transport
    /// reports its outcome.
    fn on_attempt_complete(self: &Arc<Self>, outcome: AttemptOutcome<R>) {
        if let Some(hook) = &self.pre_completion {
            hook(&outcome);
        }

        // Terminal on success and on permanent failure alike.
        if !outcome.is_transient() {
            self.complete(outcome);
            return;
        }
        let retries_used = self.retry_count.load(Ordering::SeqCst);
        if retries_used >= self.max_retries {
            debug!(
                "giving up on {} {} after {} attempts",
                self.method,
                self.url,
                retries_used + 1
            );
            self.complete(outcome);
            return;
        }
        if self.request_executor.is_shut_down() {
            self.complete(outcome);
            return;
        }

        let retry = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.base_retry_delay * 2u32.saturating_pow(retry - 1);
        warn!(
            "attempt {} for {} {} failed, retrying in {:?}",
            retry, self.method, self.url, delay
        );
        if let Some(queue) = self.owner_queue() {
            queue.stats().retries.fetch_add(1, Ordering::Relaxed);
        }
        *self.lock(&self.last_outcome) = Some(outcome);

        let this = self.clone();
        match self.scheduled_executor.schedule(delay, async move {
            this.spawn_attempt();
        }) {
            Some(timer) => {
                *self.lock(&self.retry_timer) = Some(timer);
            }
            None => {
                // Scheduled pool is gone; the latched outcome is terminal.
                let latched = self.lock(&self.last_outcome).take();
                if let Some(outcome) = latched {
                    self.complete(outcome);
                }
            }
        }
    }

    /// Latch the terminal state and deliver the callback. The compare-and-swap
    /// makes this safe against a cancel racing an attempt completion.
    fn complete(self: &Arc<Self>, outcome: AttemptOutcome<R>) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        // Release latched state and close the attempt channel so waiters
        // observe the terminal state.
        self.lock(&self.last_outcome).take();
        self.lock(&self.retry_timer).take();
        self.lock(&self.attempts_tx).take();
        let owner = self.lock(&self.owner).take();
        if let Some(queue) = owner.and_then(|weak| weak.upgrade()) {
            queue.remove(self, outcome.error.is_none());
        }

        let callback = self.lock(&self.completion).take();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    #[cfg(test)]
    fn latched_outcome_released(&self) -> bool {
        self.lock(&self.last_outcome).is_none()
    }
}

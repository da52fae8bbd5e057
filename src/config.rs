//! Configuration for this library, with various dispatch tuning settings
//!
//! Use [DispatchConfig::builder](crate::config::DispatchConfig::builder) to initialize it.
//!
//! ```
//! # use replication_dispatch::config::DispatchConfig;
//! let config = DispatchConfig::builder()
//!     .app_data(())
//!     .batch_capacity(50)
//!     .request_worker_count(8)
//!     .build()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::{
    batcher::{Batcher, Processor},
    error::Error,
    executor::{RequestExecutor, ScheduledExecutor},
    request::{
        body::Body,
        queue::RequestQueue,
        transport::{AttemptOutcome, HttpTransport, Payload},
        RequestKind,
        RetryingRequest,
        BASE_RETRY_DELAY,
        MAX_RETRIES,
    },
};
use derive_builder::Builder;
use http::{HeaderMap, Method};
use reqwest_middleware::ClientWithMiddleware;
use std::{ops::Deref, sync::Arc, time::Duration};
use url::Url;

/// Configuration for the dispatch core of a replicator.
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct DispatchConfig<T: Clone> {
    /// Data which the application requires in processors and completion
    /// callbacks, such as a database connection or replicator state.
    pub(crate) app_data: T,
    #[builder(default = "reqwest::Client::default().into()")]
    /// HTTP client used for all outgoing requests. Middleware can be used to
    /// add functionality like log tracing.
    pub(crate) client: ClientWithMiddleware,
    /// Upper bound on the group size delivered per processor call
    #[builder(default = "100")]
    pub(crate) batch_capacity: usize,
    /// Maximum batching window; also the idle threshold that triggers
    /// immediate delivery
    #[builder(default = "Duration::from_millis(500)")]
    pub(crate) batch_delay: Duration,
    /// Retries allowed beyond the first attempt
    #[builder(default = "MAX_RETRIES")]
    pub(crate) max_retries: u32,
    /// Base delay for exponential retry backoff
    #[builder(default = "BASE_RETRY_DELAY")]
    pub(crate) base_retry_delay: Duration,
    /// Timeout applied to each outbound attempt
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) request_timeout: Duration,
    /// Maximum number of concurrently running outbound attempts
    #[builder(default = "8")]
    pub(crate) request_worker_count: usize,
    /// Ask the transport to gzip request bodies
    #[builder(default = "false")]
    pub(crate) compress_requests: bool,
    /// Demote not-found logging to debug, for polling paths
    #[builder(default = "false")]
    pub(crate) suppress_404_logging: bool,
    /// Pool running delivery and retry timers. Only optional to make the
    /// builder work, it is always present once constructed.
    #[builder(setter(skip))]
    pub(crate) scheduled_executor: Option<ScheduledExecutor>,
    /// Pool running outbound attempts. Only optional to make the builder
    /// work, it is always present once constructed.
    #[builder(setter(skip))]
    pub(crate) request_executor: Option<RequestExecutor>,
}

impl<T: Clone> DispatchConfig<T> {
    /// Returns a new config builder with default values.
    pub fn builder() -> DispatchConfigBuilder<T> {
        DispatchConfigBuilder::default()
    }

    /// Create a new [Data] handle from this config.
    pub fn to_data(&self) -> Data<T> {
        Data {
            config: self.clone(),
        }
    }

    /// Whether request bodies should be compressed.
    pub fn compress_requests(&self) -> bool {
        self.compress_requests
    }

    /// Stop both executors. Buffered batches stay buffered and requests in
    /// their backoff window complete terminally with their last outcome.
    pub fn shutdown(&self) {
        self.scheduled_executor().shutdown();
        self.request_executor().shutdown();
    }

    pub(crate) fn scheduled_executor(&self) -> ScheduledExecutor {
        self.scheduled_executor
            .clone()
            .expect("config is always built with executors")
    }

    pub(crate) fn request_executor(&self) -> RequestExecutor {
        self.request_executor
            .clone()
            .expect("config is always built with executors")
    }
}

impl<T: Clone> DispatchConfigBuilder<T> {
    /// Constructs a new config instance with the values supplied to builder.
    ///
    /// Values which are not explicitly specified use the defaults. Also
    /// initializes the two executor pools, which are stored internally in the
    /// config struct.
    pub fn build(&mut self) -> Result<DispatchConfig<T>, DispatchConfigBuilderError> {
        let mut config = self.partial_build()?;
        config.scheduled_executor = Some(ScheduledExecutor::new());
        config.request_executor = Some(RequestExecutor::new(config.request_worker_count));
        Ok(config)
    }
}

impl<T: Clone> Deref for DispatchConfig<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_data
    }
}

/// A cheap handle over the config for constructing dispatch primitives.
///
/// It gives access to the `app_data` which was passed to
/// [DispatchConfig::builder].
pub struct Data<T: Clone> {
    pub(crate) config: DispatchConfig<T>,
}

impl<T: Clone> Data<T> {
    /// Returns the data which was stored in [DispatchConfigBuilder::app_data]
    pub fn app_data(&self) -> &T {
        &self.config.app_data
    }

    /// Build a batcher feeding `processor`, using the configured capacity and
    /// delay.
    pub fn batcher<I>(&self, processor: impl Processor<I> + 'static) -> Result<Batcher<I>, Error>
    where
        I: Send + 'static,
    {
        Batcher::new(
            self.config.scheduled_executor(),
            self.config.batch_capacity,
            self.config.batch_delay,
            processor,
        )
    }

    /// The bundled transport over the configured client.
    pub fn transport(&self) -> HttpTransport {
        HttpTransport::new(self.config.client.clone(), self.config.request_timeout)
            .suppress_404_logging(self.config.suppress_404_logging)
    }

    /// Build a retrying request against the bundled transport, using the
    /// configured retry policy.
    pub fn request(
        &self,
        kind: RequestKind,
        method: Method,
        url: Url,
        body: Body,
        headers: HeaderMap,
        on_complete: impl FnOnce(AttemptOutcome<Payload>) + Send + 'static,
    ) -> Result<RetryingRequest<Payload>, Error> {
        Ok(RetryingRequest::new(
            kind,
            self.config.request_executor(),
            self.config.scheduled_executor(),
            Arc::new(self.transport()),
            method,
            url,
            body,
            headers,
            on_complete,
        )?
        .with_retry_policy(self.config.max_retries, self.config.base_retry_delay))
    }

    /// A queue for tracking requests built through this handle.
    pub fn request_queue(&self) -> Arc<RequestQueue<Payload>> {
        RequestQueue::new()
    }

    /// Whether request bodies should be compressed, for passing to
    /// [`RequestQueue::submit`] or [`RetryingRequest::submit`].
    pub fn compress_requests(&self) -> bool {
        self.config.compress_requests
    }
}

impl<T: Clone> Deref for Data<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.config.app_data
    }
}

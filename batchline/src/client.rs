//! Caller-facing entry point for chunked operations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::breaker::{BreakerKey, CircuitBreakerRegistry};
use crate::cancellation::CancellationGroup;
use crate::chunker::{ChunkLimits, Chunker, EmptyBatchPolicy};
use crate::combiner::{CombinedResult, Combiner, JobOutput, ReductionRegistry};
use crate::config::BatchlineConfig;
use crate::error::{BatchError, BatchResult};
use crate::events::{self, SharedEventSink};
use crate::handle::{await_all, JobHandle};
use crate::poller::Poller;
use crate::queue_state::{PollSettings, QueueStateChange, QueueStateObserver, SubscriptionId};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::transport::{JobId, Transport};

/// Default timeout for [`CombinedFutureHandle::wait_default`].
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Submits oversized operations as chunked jobs against one endpoint.
///
/// ```rust,ignore
/// let client = BatchClient::new(transport, BreakerKey::for_endpoint(url, Some(token)));
/// let handle = client
///     .submit_chunked(items, ChunkLimits::default(), RetryPolicy::default())
///     .await?;
/// let combined = handle.wait(Duration::from_secs(600)).await?;
/// ```
pub struct BatchClient<T: Transport> {
    transport: Arc<T>,
    key: BreakerKey,
    registry: Arc<CircuitBreakerRegistry>,
    events: SharedEventSink,
    observer: Arc<QueueStateObserver>,
    reductions: ReductionRegistry,
    empty_policy: EmptyBatchPolicy,
    default_limits: ChunkLimits,
    default_policy: RetryPolicy,
    await_timeout: Duration,
    executors: Mutex<Vec<RetryExecutor>>,
}

impl<T: Transport> fmt::Debug for BatchClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchClient")
            .field("key", &self.key)
            .field("observer", &self.observer)
            .field("empty_policy", &self.empty_policy)
            .field("default_limits", &self.default_limits)
            .field("default_policy", &self.default_policy)
            .field("await_timeout", &self.await_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> BatchClient<T> {
    /// Create a client using the process-wide breaker registry and defaults.
    #[must_use]
    pub fn new(transport: T, key: BreakerKey) -> Self {
        let events = events::default_sink();
        Self {
            transport: Arc::new(transport),
            key,
            registry: CircuitBreakerRegistry::global(),
            observer: Arc::new(
                QueueStateObserver::new(PollSettings::default()).with_event_sink(Arc::clone(&events)),
            ),
            events,
            reductions: ReductionRegistry::default(),
            empty_policy: EmptyBatchPolicy::default(),
            default_limits: ChunkLimits::default(),
            default_policy: RetryPolicy::default(),
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            executors: Mutex::new(Vec::new()),
        }
    }

    /// Create a client whose defaults come from `config`.
    ///
    /// Breakers come from the process-wide registry for the `[breaker]`
    /// settings, see [`BatchlineConfig::breaker_registry`].
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if `config` fails validation.
    pub fn from_config(transport: T, key: BreakerKey, config: &BatchlineConfig) -> BatchResult<Self> {
        config.validate()?;
        Ok(Self::new(transport, key)
            .with_registry(config.breaker_registry())
            .with_poll_settings(config.polling.to_settings())
            .with_empty_policy(config.chunking.empty_batch)
            .with_default_limits(config.chunking.to_limits())
            .with_default_policy(config.retry.to_policy())
            .with_await_timeout(config.polling.await_timeout()))
    }

    /// Use `registry` for breaker lookups instead of the global one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = registry;
        self.executors.get_mut().clear();
        self
    }

    /// Report lifecycle events to `sink`.
    ///
    /// Replaces the queue-state observer; call before subscribing.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self.executors.get_mut().clear();
        self.observer = Arc::new(
            QueueStateObserver::new(*self.observer.settings()).with_event_sink(Arc::clone(&self.events)),
        );
        self
    }

    /// Set the poll cadence.
    ///
    /// Replaces the queue-state observer; call before subscribing. Settings
    /// failing [`PollSettings::validate`] make every submission fail with
    /// [`BatchError::InvalidInput`].
    #[must_use]
    pub fn with_poll_settings(mut self, settings: PollSettings) -> Self {
        self.observer =
            Arc::new(QueueStateObserver::new(settings).with_event_sink(Arc::clone(&self.events)));
        self
    }

    /// Set the metric reductions.
    #[must_use]
    pub fn with_reduction_registry(mut self, reductions: ReductionRegistry) -> Self {
        self.reductions = reductions;
        self
    }

    /// Set what an empty batch does.
    #[must_use]
    pub const fn with_empty_policy(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    /// Set the limits used by [`submit`](Self::submit).
    #[must_use]
    pub const fn with_default_limits(mut self, limits: ChunkLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Set the policy used by [`submit`](Self::submit).
    #[must_use]
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set the timeout used by [`CombinedFutureHandle::wait_default`].
    #[must_use]
    pub const fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    /// Register `callback` for queue-state changes of any job of this client.
    pub fn on_queue_state_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&QueueStateChange) + Send + Sync + 'static,
    {
        self.observer.on_change(callback)
    }

    /// Remove a queue-state subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observer.unsubscribe(id)
    }

    /// The endpoint identity.
    #[must_use]
    pub const fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// The breaker registry in use.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// The executor for `policy`, shared by every operation of this client
    /// running under an equal policy.
    ///
    /// `max_concurrent_attempts` therefore bounds attempts across those
    /// operations, not per operation.
    fn executor(&self, policy: RetryPolicy) -> BatchResult<RetryExecutor> {
        let mut executors = self.executors.lock();
        if let Some(executor) = executors.iter().find(|executor| *executor.policy() == policy) {
            return Ok(executor.clone());
        }
        let executor = RetryExecutor::with_registry(policy, Arc::clone(&self.registry))?
            .with_event_sink(Arc::clone(&self.events));
        executors.push(executor.clone());
        Ok(executor)
    }

    /// A poller running under `policy`, e.g. to resume a retained job id.
    ///
    /// Pollers built for equal policies share one concurrency bound.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the policy or the poll
    /// cadence is invalid.
    pub fn poller(&self, policy: RetryPolicy) -> BatchResult<Poller<T>> {
        self.observer.settings().validate()?;
        let executor = self.executor(policy)?;
        Ok(Poller::new(
            Arc::clone(&self.transport),
            self.key.clone(),
            executor,
            Arc::clone(&self.observer),
        )
        .with_event_sink(Arc::clone(&self.events)))
    }

    /// [`submit_chunked`](Self::submit_chunked) with the client's default limits and policy.
    ///
    /// # Errors
    ///
    /// See [`submit_chunked`](Self::submit_chunked).
    pub async fn submit(&self, items: Vec<T::Item>) -> BatchResult<CombinedFutureHandle<T::Output>> {
        self.submit_chunked(items, self.default_limits, self.default_policy.clone())
            .await
    }

    /// Split `items` into chunks and submit them all concurrently.
    ///
    /// Returns once every chunk has been accepted; polling continues in the
    /// background until the returned handle is awaited, cancelled or dropped.
    ///
    /// # Errors
    ///
    /// - [`BatchError::InvalidInput`] for invalid limits or policy, or an empty
    ///   batch under [`EmptyBatchPolicy::Reject`].
    /// - [`BatchError::ChunkFailed`] if any chunk could not be submitted; chunks
    ///   already accepted stop being polled.
    #[instrument(skip(self, items, policy), fields(key = %self.key, items = items.len()))]
    pub async fn submit_chunked(
        &self,
        items: Vec<T::Item>,
        limits: ChunkLimits,
        policy: RetryPolicy,
    ) -> BatchResult<CombinedFutureHandle<T::Output>> {
        let poller = self.poller(policy)?;
        let transport = Arc::clone(&self.transport);
        let chunks = Chunker::new(limits)
            .with_empty_policy(self.empty_policy)
            .split(items, |item| transport.weight_units(item))?;

        let chunk_count = chunks.len();
        let handles = try_join_all(chunks.into_iter().map(|chunk| {
            let poller = &poller;
            async move {
                let index = chunk.index;
                poller
                    .submit(chunk)
                    .await
                    .map_err(|error| BatchError::chunk(index, error))
            }
        }))
        .await?;

        info!(chunks = chunk_count, "Submitted chunked operation");
        Ok(CombinedFutureHandle::new(
            handles,
            Combiner::new(self.reductions.clone()).with_event_sink(Arc::clone(&self.events)),
        )
        .with_default_timeout(self.await_timeout))
    }
}

/// Handle over every chunk job of one logical operation.
pub struct CombinedFutureHandle<O> {
    handles: Vec<JobHandle<JobOutput<O>>>,
    group: CancellationGroup,
    combiner: Combiner,
    default_timeout: Duration,
}

impl<O> fmt::Debug for CombinedFutureHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedFutureHandle")
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl<O> CombinedFutureHandle<O> {
    /// Group handles, in chunk order, with the combiner for their results.
    #[must_use]
    pub fn new(handles: Vec<JobHandle<JobOutput<O>>>, combiner: Combiner) -> Self {
        let group = CancellationGroup::new();
        for handle in &handles {
            group.register(handle.chunk_index(), handle.token().clone());
        }
        Self {
            handles,
            group,
            combiner,
            default_timeout: DEFAULT_AWAIT_TIMEOUT,
        }
    }

    /// Set the timeout used by [`wait_default`](Self::wait_default).
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The timeout used by [`wait_default`](Self::wait_default).
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Per-chunk handles, in chunk order.
    #[must_use]
    pub fn handles(&self) -> &[JobHandle<JobOutput<O>>] {
        &self.handles
    }

    /// Server-assigned job ids, in chunk order.
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.handles.iter().map(|handle| handle.id().clone()).collect()
    }

    /// Whether every chunk job has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.handles.iter().all(JobHandle::is_terminal)
    }

    /// Stop polling every chunk job.
    pub fn cancel(&self) {
        self.group.cancel_all();
    }

    /// Take the per-chunk handles, e.g. to wait on them individually.
    #[must_use]
    pub fn into_handles(self) -> Vec<JobHandle<JobOutput<O>>> {
        self.handles
    }
}

impl<O: Clone> CombinedFutureHandle<O> {
    /// Wait up to `timeout` for every chunk, then combine.
    ///
    /// # Errors
    ///
    /// - [`BatchError::Timeout`] if `timeout` elapses first; every outstanding
    ///   loop is cancelled.
    /// - [`BatchError::ChunkFailed`] if any chunk failed.
    pub async fn wait(&self, timeout: Duration) -> BatchResult<CombinedResult<O>> {
        debug!(chunks = self.handles.len(), "Awaiting chunked operation");
        await_all(&self.handles, timeout).await?;
        self.combiner.combine(&self.handles)
    }

    /// [`wait`](Self::wait) with the client's await timeout.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub async fn wait_default(&self) -> BatchResult<CombinedResult<O>> {
        self.wait(self.default_timeout).await
    }
}

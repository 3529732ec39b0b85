//! Submission and per-job polling loops.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::BreakerKey;
use crate::cancellation::CancellationToken;
use crate::chunker::Chunk;
use crate::combiner::JobOutput;
use crate::error::{BatchError, BatchResult};
use crate::events::{self, Event, SharedEventSink};
use crate::handle::{JobHandle, JobSnapshot};
use crate::queue_state::{QueueState, QueueStateChange, QueueStateObserver};
use crate::retry::RetryExecutor;
use crate::transport::{JobId, PollStatus, Transport};

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome<R> {
    /// Not finished yet.
    Pending(QueueState),
    /// Finished with a result.
    Completed(R),
    /// The server reported the job as failed.
    Failed(BatchError),
}

/// Handle type produced for a transport's jobs.
pub type TransportHandle<T> = JobHandle<JobOutput<<T as Transport>::Output>>;

/// Submits chunks and polls their jobs to completion.
///
/// Every transport call goes through the retry executor under one breaker key.
pub struct Poller<T: Transport> {
    transport: Arc<T>,
    key: BreakerKey,
    executor: RetryExecutor,
    observer: Arc<QueueStateObserver>,
    events: SharedEventSink,
}

impl<T: Transport> Clone for Poller<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            key: self.key.clone(),
            executor: self.executor.clone(),
            observer: Arc::clone(&self.observer),
            events: Arc::clone(&self.events),
        }
    }
}

impl<T: Transport> fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("key", &self.key)
            .field("executor", &self.executor)
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Poller<T> {
    /// Create a poller.
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        key: BreakerKey,
        executor: RetryExecutor,
        observer: Arc<QueueStateObserver>,
    ) -> Self {
        Self {
            transport,
            key,
            executor,
            observer,
            events: events::default_sink(),
        }
    }

    /// Report job lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    /// The breaker key every call runs under.
    #[must_use]
    pub const fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// Submit one chunk and start polling its job.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the retry engine's error if the submission never succeeded.
    pub async fn submit(&self, chunk: Chunk<Vec<T::Item>>) -> BatchResult<TransportHandle<T>> {
        let Chunk {
            index,
            payload,
            weight,
            weight_units,
        } = chunk;

        let job_id = self
            .executor
            .execute("submit_job", &self.key, || self.transport.submit_job(&payload))
            .await?;

        info!(
            job_id = %job_id,
            chunk_index = index,
            weight,
            weight_units,
            "Submitted chunk"
        );
        self.events.emit(
            &Event::new(events::JOB_SUBMITTED)
                .with("job_id", job_id.as_str())
                .with("chunk_index", index)
                .with("weight", weight),
        );

        Ok(self.spawn_polling(job_id, index, weight))
    }

    /// Start polling a job submitted earlier, e.g. after a timed-out wait.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn resume(&self, job_id: JobId, chunk_index: usize, weight: usize) -> TransportHandle<T> {
        debug!(job_id = %job_id, chunk_index, "Resuming polling");
        self.spawn_polling(job_id, chunk_index, weight)
    }

    /// Poll a job once through the retry executor.
    ///
    /// # Errors
    ///
    /// Returns the retry engine's error if no poll succeeded, or
    /// [`BatchError::InvalidResponse`] if a completed job carries no result.
    pub async fn poll(&self, job_id: &JobId) -> BatchResult<PollOutcome<JobOutput<T::Output>>> {
        let response = self
            .executor
            .execute("poll_job", &self.key, || self.transport.poll_job(job_id))
            .await?;

        match response.status {
            PollStatus::Pending => Ok(PollOutcome::Pending(response.queue_state)),
            PollStatus::Completed => response.result.map(PollOutcome::Completed).ok_or_else(|| {
                BatchError::InvalidResponse(format!("job {job_id} completed without a result"))
            }),
            PollStatus::Failed => Ok(PollOutcome::Failed(BatchError::JobFailed {
                job_id: job_id.to_string(),
                message: response
                    .error
                    .unwrap_or_else(|| "server reported failure without a message".to_string()),
            })),
        }
    }

    fn spawn_polling(&self, job_id: JobId, chunk_index: usize, weight: usize) -> TransportHandle<T> {
        let (tx, rx) = watch::channel(JobSnapshot::Pending(QueueState::Active));
        let token = CancellationToken::new();
        let handle = JobHandle::new(job_id.clone(), chunk_index, weight, rx, token.clone());

        let poller = self.clone();
        tokio::spawn(async move {
            poller.run(job_id, chunk_index, tx, token).await;
        });

        handle
    }

    async fn run(
        self,
        job_id: JobId,
        chunk_index: usize,
        tx: watch::Sender<JobSnapshot<JobOutput<T::Output>>>,
        token: CancellationToken,
    ) {
        let interval = self.observer.settings().interval;
        let mut last_state = QueueState::Active;

        loop {
            let Ok(outcome) = token.run_until_cancelled(self.poll(&job_id)).await else {
                debug!(job_id = %job_id, chunk_index, "Polling cancelled");
                return;
            };

            let terminal = match outcome {
                Ok(PollOutcome::Pending(state)) => {
                    if state != last_state {
                        self.observer.notify(&QueueStateChange {
                            job_id: job_id.clone(),
                            chunk_index,
                            previous: last_state,
                            current: state,
                        });
                        last_state = state;
                    }
                    tx.send_replace(JobSnapshot::Pending(state));
                    if tx.is_closed() {
                        debug!(job_id = %job_id, chunk_index, "Handle dropped, stopping poll");
                        return;
                    }

                    let delay = self.observer.next_poll_delay(state, interval);
                    if token
                        .run_until_cancelled(tokio::time::sleep(delay))
                        .await
                        .is_err()
                    {
                        debug!(job_id = %job_id, chunk_index, "Polling cancelled");
                        return;
                    }
                    continue;
                }
                Ok(PollOutcome::Completed(result)) => JobSnapshot::Completed(Arc::new(result)),
                Ok(PollOutcome::Failed(error)) | Err(error) => JobSnapshot::Failed(error),
            };

            self.finish(&job_id, chunk_index, &terminal);
            tx.send_replace(terminal);
            return;
        }
    }

    fn finish(&self, job_id: &JobId, chunk_index: usize, terminal: &JobSnapshot<JobOutput<T::Output>>) {
        let state = terminal.state();
        let mut event = Event::new(events::JOB_TERMINAL)
            .with("job_id", job_id.as_str())
            .with("chunk_index", chunk_index)
            .with("state", state.name());

        if let JobSnapshot::Failed(error) = terminal {
            warn!(job_id = %job_id, chunk_index, error = %error, "Job failed");
            event = event.with("error_kind", error.kind());
        } else {
            info!(job_id = %job_id, chunk_index, "Job completed");
        }
        self.events.emit(&event);
    }
}

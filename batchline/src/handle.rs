//! Client-side handle to one submitted job.
//!
//! A [`JobHandle`] is a read-only view. Its polling task is the single writer:
//! it publishes [`JobSnapshot`]s through a watch channel and stops publishing
//! once the job is terminal, so a terminal result or error never changes and
//! can be read from any task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::error::{BatchError, BatchResult};
use crate::queue_state::QueueState;
use crate::transport::JobId;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued or running on the server.
    Pending,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobState {
    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What a handle currently knows about its job.
#[derive(Debug)]
pub enum JobSnapshot<R> {
    /// Not finished; carries the last reported queue state.
    Pending(QueueState),
    /// Finished successfully.
    Completed(Arc<R>),
    /// Finished unsuccessfully.
    Failed(BatchError),
}

impl<R> Clone for JobSnapshot<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending(state) => Self::Pending(*state),
            Self::Completed(result) => Self::Completed(Arc::clone(result)),
            Self::Failed(error) => Self::Failed(error.clone()),
        }
    }
}

impl<R> JobSnapshot<R> {
    /// The lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        match self {
            Self::Pending(_) => JobState::Pending,
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
        }
    }

    /// Whether the snapshot is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    fn outcome(&self) -> Option<BatchResult<Arc<R>>> {
        match self {
            Self::Pending(_) => None,
            Self::Completed(result) => Some(Ok(Arc::clone(result))),
            Self::Failed(error) => Some(Err(error.clone())),
        }
    }
}

/// Handle to one submitted chunk job.
///
/// Dropping the handle cancels its polling loop.
pub struct JobHandle<R> {
    id: JobId,
    chunk_index: usize,
    weight: usize,
    submitted_at: DateTime<Utc>,
    snapshot: watch::Receiver<JobSnapshot<R>>,
    token: CancellationToken,
}

impl<R> fmt::Debug for JobHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("chunk_index", &self.chunk_index)
            .field("weight", &self.weight)
            .field("submitted_at", &self.submitted_at)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<R> JobHandle<R> {
    pub(crate) fn new(
        id: JobId,
        chunk_index: usize,
        weight: usize,
        snapshot: watch::Receiver<JobSnapshot<R>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            chunk_index,
            weight,
            submitted_at: Utc::now(),
            snapshot,
            token,
        }
    }

    /// A handle that is already in `snapshot` and has no polling loop.
    #[must_use]
    pub fn resolved(id: JobId, chunk_index: usize, weight: usize, snapshot: JobSnapshot<R>) -> Self {
        let (_tx, rx) = watch::channel(snapshot);
        Self::new(id, chunk_index, weight, rx, CancellationToken::new())
    }

    /// Server-assigned job id.
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Index of the chunk this job carries.
    #[must_use]
    pub const fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Number of data points in the chunk.
    #[must_use]
    pub const fn weight(&self) -> usize {
        self.weight
    }

    /// When the handle was created.
    #[must_use]
    pub const fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.snapshot.borrow().state()
    }

    /// Last reported queue state; `Active` once terminal.
    #[must_use]
    pub fn queue_state(&self) -> QueueState {
        match *self.snapshot.borrow() {
            JobSnapshot::Pending(state) => state,
            _ => QueueState::Active,
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot<R> {
        self.snapshot.borrow().clone()
    }

    /// Whether the job has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.snapshot.borrow().is_terminal()
    }

    /// The result, once completed.
    #[must_use]
    pub fn result(&self) -> Option<Arc<R>> {
        match &*self.snapshot.borrow() {
            JobSnapshot::Completed(result) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    /// The error, once failed.
    #[must_use]
    pub fn error(&self) -> Option<BatchError> {
        match &*self.snapshot.borrow() {
            JobSnapshot::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Whether the polling loop has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the polling loop. The job itself keeps running server-side.
    pub fn cancel(&self) {
        if !self.is_terminal() {
            debug!(job_id = %self.id, chunk_index = self.chunk_index, "Cancelling polling loop");
        }
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait up to `timeout` for the job to finish.
    ///
    /// On timeout the polling loop is cancelled; the job id stays valid for a
    /// fresh handle via [`Poller::resume`](crate::poller::Poller::resume).
    ///
    /// # Errors
    ///
    /// - [`BatchError::Timeout`] if `timeout` elapses first.
    /// - [`BatchError::Cancelled`] if the loop was cancelled before a result.
    /// - The job's own error if it failed.
    pub async fn wait(&self, timeout: Duration) -> BatchResult<Arc<R>> {
        if let Ok(outcome) = tokio::time::timeout(timeout, self.wait_terminal()).await {
            outcome
        } else {
            warn!(
                job_id = %self.id,
                chunk_index = self.chunk_index,
                timeout_ms = crate::retry::duration_ms(timeout),
                "Timed out waiting for job"
            );
            self.token.cancel();
            Err(BatchError::Timeout(timeout))
        }
    }

    pub(crate) async fn wait_terminal(&self) -> BatchResult<Arc<R>> {
        let mut rx = self.snapshot.clone();
        let outcome = match rx.wait_for(JobSnapshot::is_terminal).await {
            Ok(snapshot) => snapshot.outcome(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(BatchError::Cancelled(self.id.to_string())))
    }
}

impl<R> Drop for JobHandle<R> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Wait for every handle, failing fast.
///
/// Results come back in handle order. On timeout or on the first failure every
/// outstanding polling loop is cancelled; handles that already finished keep
/// their results. When several chunks have failed by then, the lowest chunk
/// index is reported.
///
/// # Errors
///
/// - [`BatchError::Timeout`] if `timeout` elapses first.
/// - [`BatchError::ChunkFailed`] wrapping the failing chunk's error.
pub async fn await_all<R>(handles: &[JobHandle<R>], timeout: Duration) -> BatchResult<Vec<Arc<R>>> {
    let drive = async {
        let mut pending: FuturesUnordered<_> = handles
            .iter()
            .enumerate()
            .map(|(position, handle)| async move { (position, handle.wait_terminal().await) })
            .collect();

        let mut results: Vec<Option<Arc<R>>> = handles.iter().map(|_| None).collect();
        while let Some((position, outcome)) = pending.next().await {
            match outcome {
                Ok(result) => results[position] = Some(result),
                Err(error) => return Err((position, error)),
            }
        }
        Ok(results.into_iter().flatten().collect::<Vec<_>>())
    };

    let failure = match tokio::time::timeout(timeout, drive).await {
        Ok(Ok(results)) => return Ok(results),
        Ok(Err((position, error))) => {
            let first = handles
                .iter()
                .filter_map(|handle| handle.error().map(|error| (handle.chunk_index(), error)))
                .min_by_key(|(chunk_index, _)| *chunk_index)
                .unwrap_or_else(|| (handles[position].chunk_index(), error));
            BatchError::chunk(first.0, first.1)
        }
        Err(_) => BatchError::Timeout(timeout),
    };

    let outstanding = handles.iter().filter(|handle| !handle.is_terminal()).count();
    warn!(error = %failure, outstanding, "Cancelling outstanding polling loops");
    for handle in handles {
        handle.cancel();
    }
    Err(failure)
}

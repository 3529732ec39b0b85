//! Shared fixtures for integration tests
//!
//! [`ScriptedTransport`] is an in-memory backend whose jobs answer polls from
//! a script chosen by the chunk's contents.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchline::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use batchline::events::NoopEventSink;
use batchline::prelude::*;
use parking_lot::Mutex;
use tokio::time::Instant;

type Script = dyn Fn(&[u32]) -> Vec<PollResponse<JobOutput<u32>>> + Send + Sync;

/// Completed response doubling every item, with `loss` equal to the first item.
pub fn doubled(items: &[u32]) -> PollResponse<JobOutput<u32>> {
    let outputs = items.iter().map(|item| item * 2).collect();
    let loss = items.first().copied().map_or(0.0, f64::from);
    PollResponse::completed(
        JobOutput::new(outputs)
            .with_metric("loss", loss)
            .with_metric("seen:sum", items.len() as f64),
    )
}

/// `pending` pending polls in `state`, then the doubled result.
pub fn after(pending: usize, state: QueueState, items: &[u32]) -> Vec<PollResponse<JobOutput<u32>>> {
    let mut script: Vec<_> = (0..pending).map(|_| PollResponse::pending(state)).collect();
    script.push(doubled(items));
    script
}

#[derive(Default)]
struct Inner {
    next_job: usize,
    jobs: HashMap<JobId, VecDeque<PollResponse<JobOutput<u32>>>>,
    job_items: HashMap<JobId, Vec<u32>>,
    submit_failures: VecDeque<TransportError>,
    poll_failures: VecDeque<TransportError>,
    submit_calls: usize,
    submit_latency: Duration,
    submissions_in_flight: usize,
    peak_submissions: usize,
    polls: Vec<(JobId, Instant)>,
}

/// In-memory [`Transport`] for `u32` items.
///
/// A job's last scripted response repeats once the script runs out.
pub struct ScriptedTransport {
    script: Arc<Script>,
    inner: Arc<Mutex<Inner>>,
}

impl Clone for ScriptedTransport {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ScriptedTransport {
    /// Jobs answer polls with `script(items)`.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[u32]) -> Vec<PollResponse<JobOutput<u32>>> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Jobs complete on their first poll.
    pub fn immediate() -> Self {
        Self::new(|items| vec![doubled(items)])
    }

    /// Fail the next submissions with `errors`, in order.
    pub fn fail_submissions(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.inner.lock().submit_failures.extend(errors);
    }

    /// Fail the next polls with `errors`, in order.
    pub fn fail_polls(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.inner.lock().poll_failures.extend(errors);
    }

    /// Make every submission take `latency`.
    pub fn with_submit_latency(self, latency: Duration) -> Self {
        self.inner.lock().submit_latency = latency;
        self
    }

    /// Most submissions ever in flight at once.
    pub fn peak_submissions(&self) -> usize {
        self.inner.lock().peak_submissions
    }

    /// Number of `submit_job` calls, failed ones included.
    pub fn submit_calls(&self) -> usize {
        self.inner.lock().submit_calls
    }

    /// Number of accepted jobs.
    pub fn jobs(&self) -> usize {
        self.inner.lock().next_job
    }

    /// Instants at which `job_id` was polled.
    pub fn poll_times(&self, job_id: &JobId) -> Vec<Instant> {
        self.inner
            .lock()
            .polls
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Total number of polls across all jobs.
    pub fn poll_count(&self) -> usize {
        self.inner.lock().polls.len()
    }

    /// Items submitted under `job_id`.
    pub fn items_of(&self, job_id: &JobId) -> Option<Vec<u32>> {
        self.inner.lock().job_items.get(job_id).cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Item = u32;
    type Output = u32;

    async fn submit_job(&self, items: &[u32]) -> Result<JobId, TransportError> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.submissions_in_flight += 1;
            inner.peak_submissions = inner.peak_submissions.max(inner.submissions_in_flight);
            inner.submit_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let script = (self.script)(items);
        let mut inner = self.inner.lock();
        inner.submissions_in_flight -= 1;
        inner.submit_calls += 1;
        if let Some(error) = inner.submit_failures.pop_front() {
            return Err(error);
        }

        let job_id = JobId::new(format!("job-{}", inner.next_job));
        inner.next_job += 1;
        inner.jobs.insert(job_id.clone(), script.into());
        inner.job_items.insert(job_id.clone(), items.to_vec());
        Ok(job_id)
    }

    async fn poll_job(&self, job_id: &JobId) -> Result<PollResponse<JobOutput<u32>>, TransportError> {
        let mut inner = self.inner.lock();
        inner.polls.push((job_id.clone(), Instant::now()));
        if let Some(error) = inner.poll_failures.pop_front() {
            return Err(error);
        }

        let Some(script) = inner.jobs.get_mut(job_id) else {
            return Err(TransportError::from_status(404, format!("no job {job_id}")));
        };
        let response = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        response.ok_or_else(|| TransportError::from_status(500, "empty script"))
    }
}

/// A breaker registry private to one test.
pub fn isolated_registry() -> Arc<CircuitBreakerRegistry> {
    Arc::new(
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .with_event_sink(Arc::new(NoopEventSink)),
    )
}

/// A client over `transport` with an isolated registry and silent events.
pub fn client(transport: ScriptedTransport) -> BatchClient<ScriptedTransport> {
    BatchClient::new(transport, BreakerKey::new("scripted"))
        .with_registry(isolated_registry())
        .with_event_sink(Arc::new(NoopEventSink))
}

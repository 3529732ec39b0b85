//! Transport collaborator contract.
//!
//! The core never talks to the network itself. Everything it needs from the
//! backend goes through a [`Transport`]: submit one chunk as a job, and poll a
//! job by id. Connection pooling, TLS, authentication and body encoding are the
//! implementor's business.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::combiner::JobOutput;
use crate::queue_state::QueueState;

/// Server-assigned identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Who the server blames for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The request itself was bad.
    User,
    /// The server could not handle a valid request.
    Server,
    /// No verdict, e.g. the connection dropped before a response arrived.
    Unknown,
}

impl ErrorCategory {
    /// Category implied by an HTTP-style status code.
    #[must_use]
    pub const fn from_status(status_code: u16) -> Self {
        match status_code {
            400..=499 => Self::User,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

/// Error reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} error{}: {message}", .category.name(), status_suffix(.status_code))]
pub struct TransportError {
    /// Who the server blames.
    pub category: ErrorCategory,
    /// HTTP-equivalent status code, if a response was received.
    pub status_code: Option<u16>,
    /// Server-provided hint for when to retry.
    pub retry_after: Option<Duration>,
    /// Human-readable description.
    pub message: String,
}

impl TransportError {
    /// Error carrying a response status.
    pub fn status(category: ErrorCategory, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            category,
            status_code: Some(status_code),
            retry_after: None,
            message: message.into(),
        }
    }

    /// Error for a response status, categorised from the code.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        Self::status(ErrorCategory::from_status(status_code), status_code, message)
    }

    /// Connection-level failure: no response was received.
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Unknown,
            status_code: None,
            retry_after: None,
            message: message.into(),
        }
    }

    /// Attach a server-provided retry-after hint.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map_or_else(String::new, |code| format!(" (status {code})"))
}

/// Lifecycle status reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Still queued or running.
    Pending,
    /// Finished; the response carries a result.
    Completed,
    /// Finished unsuccessfully; the response carries an error.
    Failed,
}

/// One poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse<R> {
    /// Lifecycle status.
    pub status: PollStatus,
    /// Backpressure signal attached by the server.
    #[serde(default)]
    pub queue_state: QueueState,
    /// Result, present when `status` is completed.
    pub result: Option<R>,
    /// Error description, present when `status` is failed.
    pub error: Option<String>,
}

impl<R> PollResponse<R> {
    /// A pending response with the given queue state.
    #[must_use]
    pub const fn pending(queue_state: QueueState) -> Self {
        Self {
            status: PollStatus::Pending,
            queue_state,
            result: None,
            error: None,
        }
    }

    /// A completed response.
    #[must_use]
    pub const fn completed(result: R) -> Self {
        Self {
            status: PollStatus::Completed,
            queue_state: QueueState::Active,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PollStatus::Failed,
            queue_state: QueueState::Active,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The backend as seen by the core.
///
/// One chunk of [`Item`](Self::Item)s becomes one job. A completed job yields a
/// [`JobOutput`] holding one [`Output`](Self::Output) per produced result plus
/// a metrics map.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// One element of a logical batch.
    type Item: Send + Sync + 'static;

    /// One element of a job's result.
    type Output: Send + Sync + 'static;

    /// Submit one chunk as an asynchronous job.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the request could not be delivered or
    /// the server refused it.
    async fn submit_job(&self, items: &[Self::Item]) -> Result<JobId, TransportError>;

    /// Poll a previously submitted job.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the request could not be delivered or
    /// the server refused it.
    async fn poll_job(
        &self,
        job_id: &JobId,
    ) -> Result<PollResponse<JobOutput<Self::Output>>, TransportError>;

    /// Size of one item in weight units, used to cap chunk payload size.
    ///
    /// Default: 1 unit per item.
    fn weight_units(&self, item: &Self::Item) -> usize {
        let _ = item;
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_status() {
        assert_eq!(ErrorCategory::from_status(404), ErrorCategory::User);
        assert_eq!(ErrorCategory::from_status(503), ErrorCategory::Server);
        assert_eq!(ErrorCategory::from_status(302), ErrorCategory::Unknown);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::from_status(429, "slow down");
        assert_eq!(err.to_string(), "user error (status 429): slow down");

        let err = TransportError::connection("reset by peer");
        assert_eq!(err.to_string(), "unknown error: reset by peer");
    }

    #[test]
    fn test_poll_response_deserializes_with_defaults() {
        let response: PollResponse<u32> =
            serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(response.status, PollStatus::Pending);
        assert_eq!(response.queue_state, QueueState::Active);
        assert!(response.result.is_none());

        let response: PollResponse<u32> = serde_json::from_str(
            r#"{"status":"pending","queue_state":"paused_rate_limit"}"#,
        )
        .unwrap();
        assert_eq!(response.queue_state, QueueState::PausedRateLimit);
    }

    #[test]
    fn test_job_id_roundtrip_is_transparent() {
        let id = JobId::from("job-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-7\"");
        assert_eq!(id.to_string(), "job-7");
    }
}

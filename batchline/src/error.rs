//! Error types and error handling
//!
//! Every failure a caller can observe is a [`BatchError`]. Errors raised by
//! the transport collaborator are [`TransportError`]s; the retry engine either
//! recovers from them or wraps the last one in the variant that explains why
//! it gave up.

use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerKey;
use crate::transport::TransportError;

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors surfaced by the request-lifecycle core.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// Bad chunk limits, malformed batch, or a misuse of the API.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The circuit for this endpoint is open; no request was attempted.
    #[error("circuit open for {key}")]
    CircuitOpen {
        /// Endpoint identity whose breaker denied the call.
        key: BreakerKey,
    },

    /// The server rejected the request as a caller error (4xx other than 408/409/429).
    #[error("request rejected: {0}")]
    User(TransportError),

    /// Retryable failures persisted until the attempt budget ran out.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: TransportError,
    },

    /// No attempt succeeded within the progress timeout.
    #[error("no progress for {elapsed:?} (last error: {last})")]
    ProgressTimeout {
        /// Time elapsed since the first attempt.
        elapsed: Duration,
        /// The error from the final attempt.
        last: TransportError,
    },

    /// A caller-specified await timeout elapsed before the job finished.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server reported that the job itself failed.
    #[error("job {job_id} failed: {message}")]
    JobFailed {
        /// Server-assigned job identifier.
        job_id: String,
        /// Failure description reported by the server.
        message: String,
    },

    /// A chunk of a chunked operation failed; the whole operation fails with it.
    #[error("chunk {chunk_index} failed: {source}")]
    ChunkFailed {
        /// Index of the failing chunk in the original batch.
        chunk_index: usize,
        /// The chunk's own error.
        #[source]
        source: Box<BatchError>,
    },

    /// The transport returned a response the core cannot interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The polling loop was cancelled before the job reached a terminal state.
    #[error("polling cancelled for job {0}")]
    Cancelled(String),
}

impl BatchError {
    /// Wrap an error as the failure of one chunk.
    #[must_use]
    pub fn chunk(chunk_index: usize, source: Self) -> Self {
        Self::ChunkFailed {
            chunk_index,
            source: Box::new(source),
        }
    }

    /// Short, stable name for logs and telemetry.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::User(_) => "user_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::ProgressTimeout { .. } => "progress_timeout",
            Self::Timeout(_) => "timeout",
            Self::JobFailed { .. } => "job_failed",
            Self::ChunkFailed { .. } => "chunk_failed",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Whether the error came from the caller's own input.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::InvalidInput(_) | Self::User(_) => true,
            Self::ChunkFailed { source, .. } => source.is_user_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ErrorCategory;

    #[test]
    fn test_chunk_failure_wraps_source() {
        let err = BatchError::chunk(2, BatchError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), "chunk_failed");
        assert!(err.to_string().starts_with("chunk 2 failed"));
        let BatchError::ChunkFailed { chunk_index, source } = err else {
            panic!("expected chunk failure");
        };
        assert_eq!(chunk_index, 2);
        assert_eq!(source.kind(), "timeout");
    }

    #[test]
    fn test_user_error_detection() {
        let user = BatchError::User(TransportError::status(ErrorCategory::User, 400, "bad"));
        assert!(user.is_user_error());
        assert!(BatchError::chunk(0, user).is_user_error());
        assert!(!BatchError::Timeout(Duration::ZERO).is_user_error());
    }
}

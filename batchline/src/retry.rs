//! Retry and backoff engine.
//!
//! [`RetryExecutor::execute`] runs one transport operation under a
//! [`RetryPolicy`]: it asks the endpoint's circuit breaker for admission,
//! bounds how many attempts run at once, classifies each failure and sleeps
//! with capped exponential backoff between retryable ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::breaker::{Admission, BreakerKey, CircuitBreakerRegistry};
use crate::error::{BatchError, BatchResult};
use crate::events::{self, Event, SharedEventSink};
use crate::transport::{ErrorCategory, TransportError};

/// Retry configuration. Immutable once handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt cap; `None` retries until the progress timeout.
    pub max_attempts: Option<u32>,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Ceiling on the un-jittered delay.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `[0, 1]`.
    pub jitter_fraction: f64,
    /// Ceiling on time since the first attempt without a success.
    pub progress_timeout: Duration,
    /// Attempts allowed in flight at once under this policy.
    pub max_concurrent_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_fraction: 0.25,
            progress_timeout: Duration::from_secs(30 * 60),
            max_concurrent_attempts: 64,
        }
    }
}

impl RetryPolicy {
    /// Cap the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base and maximum delay.
    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    /// Set the progress timeout.
    #[must_use]
    pub const fn with_progress_timeout(mut self, progress_timeout: Duration) -> Self {
        self.progress_timeout = progress_timeout;
        self
    }

    /// Set the concurrency bound.
    #[must_use]
    pub const fn with_max_concurrent_attempts(mut self, max_concurrent_attempts: usize) -> Self {
        self.max_concurrent_attempts = max_concurrent_attempts;
        self
    }

    /// Check that the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the attempt cap or concurrency
    /// bound is zero, the jitter fraction is outside `[0, 1]`, or the base
    /// delay exceeds the maximum delay.
    pub fn validate(&self) -> BatchResult<()> {
        if self.max_attempts == Some(0) {
            return Err(BatchError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_attempts == 0 {
            return Err(BatchError::InvalidInput(
                "max_concurrent_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(BatchError::InvalidInput(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(BatchError::InvalidInput(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt`, with freshly sampled jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let sample = if self.jitter_fraction > 0.0 {
            rand::rng().random_range(-self.jitter_fraction..=self.jitter_fraction)
        } else {
            0.0
        };
        backoff_delay(self, attempt, sample, retry_after)
    }
}

/// Backoff delay after failed attempt `attempt` (1-based).
///
/// `min(max_delay, base_delay * 2^(attempt-1)) * (1 + jitter_sample)`, with
/// `jitter_sample` clamped to the policy's jitter fraction. A server-provided
/// `retry_after` replaces the computed delay and is clamped to `max_delay`.
#[must_use]
pub fn backoff_delay(
    policy: &RetryPolicy,
    attempt: u32,
    jitter_sample: f64,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after.min(policy.max_delay);
    }

    let exponent = attempt.saturating_sub(1).min(31);
    let capped = policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay);

    let jitter = jitter_sample.clamp(-policy.jitter_fraction, policy.jitter_fraction);
    capped.mul_f64((1.0 + jitter).max(0.0))
}

/// How the engine treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Caller error; surfaced immediately.
    Fatal,
    /// Transient; retried under the policy.
    Retryable,
}

impl ErrorClass {
    /// Lowercase name used in events.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
        }
    }
}

/// `classification` of a `retry_attempt` event for an attempt that succeeded.
pub const SUCCESS: &str = "success";

/// Classify a transport failure.
///
/// 408, 409 and 429 are retryable despite being 4xx; every other 4xx is
/// fatal. 5xx and connection-level failures are retryable.
#[must_use]
pub const fn classify(error: &TransportError) -> ErrorClass {
    match error.status_code {
        Some(408 | 409 | 429) => ErrorClass::Retryable,
        Some(400..=499) => ErrorClass::Fatal,
        Some(_) => ErrorClass::Retryable,
        None => match error.category {
            ErrorCategory::User => ErrorClass::Fatal,
            ErrorCategory::Server | ErrorCategory::Unknown => ErrorClass::Retryable,
        },
    }
}

/// Runs transport operations under a retry policy and the endpoint's breaker.
///
/// Cloning is cheap; clones share the concurrency bound.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    registry: Arc<CircuitBreakerRegistry>,
    events: SharedEventSink,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Create an executor using the process-wide breaker registry.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the policy is invalid.
    pub fn new(policy: RetryPolicy) -> BatchResult<Self> {
        Self::with_registry(policy, CircuitBreakerRegistry::global())
    }

    /// Create an executor using `registry` for breaker lookups.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the policy is invalid.
    pub fn with_registry(
        policy: RetryPolicy,
        registry: Arc<CircuitBreakerRegistry>,
    ) -> BatchResult<Self> {
        policy.validate()?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(policy.max_concurrent_attempts)),
            policy,
            registry,
            events: events::default_sink(),
        })
    }

    /// Report retry attempts to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The breaker registry in use.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Run `op` until it succeeds, fails fatally, or the policy gives up.
    ///
    /// `operation` names the call in logs and events.
    ///
    /// # Errors
    ///
    /// - [`BatchError::CircuitOpen`] if the breaker for `key` denies the call;
    ///   this does not count as an attempt.
    /// - [`BatchError::User`] on a fatal failure, after a single attempt.
    /// - [`BatchError::RetryExhausted`] once `max_attempts` is reached.
    /// - [`BatchError::ProgressTimeout`] once `progress_timeout` has elapsed
    ///   since the first attempt.
    pub async fn execute<T, F, Fut>(&self, operation: &str, key: &BreakerKey, mut op: F) -> BatchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let breaker = self.registry.breaker(key);
        let mut attempt: u32 = 0;
        let mut first_attempt_at: Option<Instant> = None;

        loop {
            let Admission::Permitted(permit) = breaker.allow() else {
                debug!(operation, key = %key, "Circuit open, failing fast");
                return Err(BatchError::CircuitOpen { key: key.clone() });
            };

            attempt = attempt.saturating_add(1);
            let started = *first_attempt_at.get_or_insert_with(Instant::now);

            let outcome = {
                let _slot = self.permits.acquire().await.map_err(|_| {
                    BatchError::Cancelled(format!("{operation}: retry executor closed"))
                })?;
                op().await
            };

            let error = match outcome {
                Ok(value) => {
                    permit.record_success();
                    self.emit_attempt(operation, key, attempt, SUCCESS, Duration::ZERO, None);
                    if attempt > 1 {
                        debug!(operation, key = %key, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    permit.record_failure();
                    error
                }
            };

            let class = classify(&error);
            if class == ErrorClass::Fatal {
                self.emit_attempt(operation, key, attempt, class.name(), Duration::ZERO, Some(&error));
                warn!(operation, key = %key, attempt, error = %error, "Fatal error, not retrying");
                return Err(BatchError::User(error));
            }

            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                self.emit_attempt(operation, key, attempt, class.name(), Duration::ZERO, Some(&error));
                warn!(operation, key = %key, attempt, error = %error, "Retries exhausted");
                return Err(BatchError::RetryExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.policy.progress_timeout {
                self.emit_attempt(operation, key, attempt, class.name(), Duration::ZERO, Some(&error));
                warn!(
                    operation,
                    key = %key,
                    attempt,
                    elapsed_ms = duration_ms(elapsed),
                    "No progress within timeout"
                );
                return Err(BatchError::ProgressTimeout {
                    elapsed,
                    last: error,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt, error.retry_after);
            self.emit_attempt(operation, key, attempt, class.name(), delay, Some(&error));
            debug!(
                operation,
                key = %key,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn emit_attempt(
        &self,
        operation: &str,
        key: &BreakerKey,
        attempt: u32,
        classification: &str,
        delay: Duration,
        error: Option<&TransportError>,
    ) {
        let mut event = Event::new(events::RETRY_ATTEMPT)
            .with("operation", operation)
            .with("key", key.as_str())
            .with("attempt", attempt)
            .with("delay_ms", duration_ms(delay))
            .with("classification", classification);
        if let Some(error) = error {
            event = event.with("error", error.to_string());
            if let Some(status_code) = error.status_code {
                event = event.with("status_code", status_code);
            }
        }
        self.events.emit(&event);
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(cooldown elapsed)--> HalfOpen
//! HalfOpen --(probe succeeds)--> Closed
//! HalfOpen --(probe fails)--> Open
//! ```
//!
//! Each breaker is a single mutable cell behind a mutex; every transition is
//! one critical section. Breakers are keyed by endpoint identity and live in a
//! [`CircuitBreakerRegistry`] for the lifetime of the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{self, Event, SharedEventSink};

/// Opaque endpoint identity a breaker is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakerKey(String);

impl BreakerKey {
    /// Create a key from any string identity.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from a base URL and an optional credential.
    ///
    /// The credential is fingerprinted, never stored.
    #[must_use]
    pub fn for_endpoint(base_url: &str, credential: Option<&str>) -> Self {
        let base = base_url.trim_end_matches('/');
        credential.map_or_else(
            || Self(base.to_string()),
            |credential| {
                let digest = Sha256::digest(credential.as_bytes());
                let fingerprint = hex::encode(&digest[..8]);
                Self(format!("{base}#{fingerprint}"))
            },
        )
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the cooldown elapses.
    Open,
    /// Admitting a single probe.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a probe is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// How long the breaker has been open, if it is.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    // Bumped on every trip; verdicts from permits of an older generation are stale.
    generation: u64,
}

impl BreakerCell {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            generation: 0,
        }
    }
}

/// Outcome of asking a breaker for admission.
#[derive(Debug)]
pub enum Admission {
    /// The call may proceed; report its outcome through the permit.
    Permitted(Permit),
    /// The call must fail fast.
    Denied,
}

impl Admission {
    /// The permit, if admitted.
    #[must_use]
    pub fn permit(self) -> Option<Permit> {
        match self {
            Self::Permitted(permit) => Some(permit),
            Self::Denied => None,
        }
    }

    /// Whether the call was admitted.
    #[must_use]
    pub const fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted(_))
    }
}

/// Right to make one call through a breaker.
///
/// Consumed by [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A half-open probe permit dropped
/// without a verdict frees the probe slot so the next caller can probe.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    generation: u64,
    settled: bool,
}

impl Permit {
    /// Whether this permit is the half-open probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report that the call succeeded.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, true);
    }

    /// Report that the call failed.
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, false);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Failure-rate state machine for one endpoint.
pub struct CircuitBreaker {
    key: BreakerKey,
    config: CircuitBreakerConfig,
    cell: Mutex<BreakerCell>,
    events: SharedEventSink,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("cell", &*self.cell.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker that reports transitions to the default sink.
    #[must_use]
    pub fn new(key: BreakerKey, config: CircuitBreakerConfig) -> Self {
        Self::with_event_sink(key, config, events::default_sink())
    }

    /// Create a closed breaker reporting transitions to `sink`.
    #[must_use]
    pub fn with_event_sink(
        key: BreakerKey,
        config: CircuitBreakerConfig,
        sink: SharedEventSink,
    ) -> Self {
        Self {
            key,
            config,
            cell: Mutex::new(BreakerCell::new()),
            events: sink,
        }
    }

    /// The endpoint identity.
    #[must_use]
    pub const fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// The breaker's tuning.
    #[must_use]
    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Current state. An open breaker whose cooldown has elapsed still reads
    /// `Open` until the next [`allow`](Self::allow) admits the probe.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.cell.lock().state
    }

    /// Point-in-time view for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let cell = self.cell.lock();
        CircuitBreakerSnapshot {
            state: cell.state,
            consecutive_failures: cell.consecutive_failures,
            open_for: cell.opened_at.map(|opened_at| opened_at.elapsed()),
        }
    }

    /// Ask for admission. Must precede every call to the endpoint.
    pub fn allow(self: &Arc<Self>) -> Admission {
        let now = Instant::now();
        let mut event = None;
        let admission = {
            let mut cell = self.cell.lock();
            let cooled = cell
                .opened_at
                .is_none_or(|opened_at| now.duration_since(opened_at) >= self.config.cooldown);
            let probe = match cell.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open if cooled => {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_in_flight = true;
                    event = Some(self.event(events::CIRCUIT_HALF_OPEN, &cell));
                    Some(true)
                }
                CircuitState::Open => None,
                CircuitState::HalfOpen if cell.probe_in_flight => None,
                CircuitState::HalfOpen => {
                    cell.probe_in_flight = true;
                    Some(true)
                }
            };
            probe.map(|probe| (probe, cell.generation))
        };

        if let Some(event) = event {
            info!(key = %self.key, "Circuit half-open, admitting probe");
            self.events.emit(&event);
        }

        match admission {
            Some((probe, generation)) => Admission::Permitted(Permit {
                breaker: Arc::clone(self),
                probe,
                generation,
                settled: false,
            }),
            None => {
                debug!(key = %self.key, "Circuit denied call");
                Admission::Denied
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let event = {
            let mut cell = self.cell.lock();
            self.apply_success(&mut cell)
        };
        self.emit(event);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let event = {
            let mut cell = self.cell.lock();
            self.apply_failure(&mut cell)
        };
        self.emit(event);
    }

    fn settle(&self, generation: u64, success: bool) {
        let event = {
            let mut cell = self.cell.lock();
            if cell.generation != generation {
                debug!(key = %self.key, "Ignoring verdict from a stale permit");
                return;
            }
            if success {
                self.apply_success(&mut cell)
            } else {
                self.apply_failure(&mut cell)
            }
        };
        self.emit(event);
    }

    fn release_probe(&self, generation: u64) {
        let mut cell = self.cell.lock();
        if cell.generation == generation && cell.state == CircuitState::HalfOpen {
            cell.probe_in_flight = false;
        }
    }

    fn apply_success(&self, cell: &mut BreakerCell) -> Option<Event> {
        match cell.state {
            CircuitState::Closed => {
                cell.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                cell.state = CircuitState::Closed;
                cell.consecutive_failures = 0;
                cell.opened_at = None;
                cell.probe_in_flight = false;
                info!(key = %self.key, "Circuit closed after successful probe");
                Some(self.event(events::CIRCUIT_CLOSED, cell))
            }
            CircuitState::Open => None,
        }
    }

    fn apply_failure(&self, cell: &mut BreakerCell) -> Option<Event> {
        match cell.state {
            CircuitState::Closed => {
                cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);
                if cell.consecutive_failures >= self.config.failure_threshold {
                    Some(self.trip(cell))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);
                Some(self.trip(cell))
            }
            CircuitState::Open => None,
        }
    }

    fn trip(&self, cell: &mut BreakerCell) -> Event {
        cell.state = CircuitState::Open;
        cell.opened_at = Some(Instant::now());
        cell.probe_in_flight = false;
        cell.generation = cell.generation.wrapping_add(1);
        warn!(
            key = %self.key,
            consecutive_failures = cell.consecutive_failures,
            cooldown_ms = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX),
            "Circuit opened after repeated failures"
        );
        self.event(events::CIRCUIT_OPENED, cell)
    }

    fn event(&self, name: &'static str, cell: &BreakerCell) -> Event {
        Event::new(name)
            .with("key", self.key.as_str())
            .with("consecutive_failures", cell.consecutive_failures)
    }

    fn emit(&self, event: Option<Event>) {
        if let Some(event) = event {
            self.events.emit(&event);
        }
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<CircuitBreakerRegistry>> =
    Lazy::new(|| Arc::new(CircuitBreakerRegistry::default()));

static TUNED_REGISTRIES: Lazy<Mutex<HashMap<CircuitBreakerConfig, Arc<CircuitBreakerRegistry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Lazily populated map from endpoint identity to breaker.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<BreakerKey, Arc<CircuitBreaker>>>,
    events: SharedEventSink,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create an empty registry whose breakers use `config`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: events::default_sink(),
        }
    }

    /// Report transitions of breakers created from now on to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// The process-wide registry for `config`, created on first use.
    ///
    /// The default configuration maps to [`global`](Self::global).
    #[must_use]
    pub fn shared(config: CircuitBreakerConfig) -> Arc<Self> {
        if config == CircuitBreakerConfig::default() {
            return Self::global();
        }
        let mut registries = TUNED_REGISTRIES.lock();
        Arc::clone(
            registries
                .entry(config)
                .or_insert_with(|| Arc::new(Self::new(config))),
        )
    }

    /// The breaker for `key`, created on first use.
    #[must_use]
    pub fn breaker(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating circuit breaker");
            Arc::new(CircuitBreaker::with_event_sink(
                key.clone(),
                self.config,
                Arc::clone(&self.events),
            ))
        }))
    }

    /// The breaker for `key`, if one exists.
    #[must_use]
    pub fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(key).cloned()
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    /// Whether no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventSink;

    fn breaker(threshold: u32, cooldown: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::with_event_sink(
            BreakerKey::new("test"),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
            Arc::new(events::NoopEventSink),
        ))
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        breaker
            .allow()
            .permit()
            .expect("closed breaker admits")
            .record_failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_probes_after_cooldown() {
        let breaker = breaker(5, Duration::from_secs(10));

        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow().is_permitted());

        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = breaker.allow().permit().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Concurrent callers during the probe fail fast.
        assert!(!breaker.allow().is_permitted());

        probe.record_success();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.open_for.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = breaker(1, Duration::from_secs(5));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        breaker.allow().permit().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // The cooldown restarts from the failed probe.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!breaker.allow().is_permitted());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.allow().is_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let breaker = breaker(1, Duration::from_secs(1));
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = breaker.allow().permit().unwrap();
        drop(probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow().permit().unwrap().is_probe());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(1));
        fail(&breaker);
        fail(&breaker);
        breaker.allow().permit().unwrap().record_success();
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_verdict_is_ignored() {
        let breaker = breaker(1, Duration::from_secs(1));
        let stale = breaker.allow().permit().unwrap();
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = breaker.allow().permit().unwrap();

        // A success from before the trip must not close the half-open breaker.
        stale.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        probe.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_transitions_emit_events() {
        let mut sink = MockEventSink::new();
        sink.expect_emit()
            .withf(|event| event.name == events::CIRCUIT_OPENED)
            .times(1)
            .return_const(());
        let breaker = Arc::new(CircuitBreaker::with_event_sink(
            BreakerKey::new("events"),
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            Arc::new(sink),
        ));

        breaker.record_failure();
        breaker.record_failure();
        // Already open: no second event.
        breaker.record_failure();
    }

    #[test]
    fn test_registry_is_keyed_and_lazy() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        assert!(registry.is_empty());

        let key = BreakerKey::new("https://api.example.com");
        let first = registry.breaker(&key);
        let second = registry.breaker(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get(&BreakerKey::new("other")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_registry_per_config() {
        let tuned = CircuitBreakerConfig {
            failure_threshold: 11,
            cooldown: Duration::from_secs(7),
        };
        let first = CircuitBreakerRegistry::shared(tuned);
        assert!(Arc::ptr_eq(&first, &CircuitBreakerRegistry::shared(tuned)));
        assert_eq!(first.breaker(&BreakerKey::new("tuned")).config(), tuned);

        assert!(Arc::ptr_eq(
            &CircuitBreakerRegistry::shared(CircuitBreakerConfig::default()),
            &CircuitBreakerRegistry::global()
        ));
    }

    #[test]
    fn test_endpoint_key_fingerprints_credential() {
        let key = BreakerKey::for_endpoint("https://api.example.com/", Some("secret-token"));
        assert!(key.as_str().starts_with("https://api.example.com#"));
        assert!(!key.as_str().contains("secret-token"));
        assert_ne!(
            key,
            BreakerKey::for_endpoint("https://api.example.com", Some("other-token"))
        );
        assert_eq!(
            BreakerKey::for_endpoint("https://api.example.com/", None).as_str(),
            "https://api.example.com"
        );
    }
}

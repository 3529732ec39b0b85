//! Server backpressure signals and poll pacing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BatchError, BatchResult};
use crate::events::{self, Event, SharedEventSink};
use crate::transport::JobId;

/// Backpressure state reported with each poll response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// The server is processing normally.
    #[default]
    Active,
    /// The client is being throttled.
    PausedRateLimit,
    /// The server is over capacity.
    PausedCapacity,
    /// A state this client does not recognise.
    #[serde(other)]
    Unknown,
}

impl QueueState {
    /// Decode a wire value; anything unrecognised is [`Unknown`](Self::Unknown).
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "paused_rate_limit" => Self::PausedRateLimit,
            "paused_capacity" => Self::PausedCapacity,
            _ => Self::Unknown,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PausedRateLimit => "paused_rate_limit",
            Self::PausedCapacity => "paused_capacity",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the server has paused work for this client.
    #[must_use]
    pub const fn is_paused(self) -> bool {
        matches!(self, Self::PausedRateLimit | Self::PausedCapacity)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Delay between polls while the queue is active.
    pub interval: Duration,
    /// Interval multiplier while rate limited.
    pub rate_limit_multiplier: f64,
    /// Interval multiplier while the server is over capacity.
    pub capacity_multiplier: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            rate_limit_multiplier: 2.0,
            capacity_multiplier: 4.0,
        }
    }
}

impl PollSettings {
    /// Check that the cadence is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the interval is zero, a
    /// multiplier is not a finite value of at least 1, or capacity pauses
    /// back off less than rate-limit pauses.
    pub fn validate(&self) -> BatchResult<()> {
        if self.interval.is_zero() {
            return Err(BatchError::InvalidInput(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("rate_limit_multiplier", self.rate_limit_multiplier),
            ("capacity_multiplier", self.capacity_multiplier),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(BatchError::InvalidInput(format!(
                    "{name} must be a finite value of at least 1, got {value}"
                )));
            }
        }
        if self.capacity_multiplier < self.rate_limit_multiplier {
            return Err(BatchError::InvalidInput(
                "capacity_multiplier must not be below rate_limit_multiplier".to_string(),
            ));
        }
        Ok(())
    }
}

/// `base` scaled by `multiplier`; an unrepresentable product keeps `base`.
fn scaled(base: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * multiplier).unwrap_or_else(|_| {
        warn!(multiplier, "Unusable poll multiplier; pacing as active");
        base
    })
}

/// A job's queue state changed between two polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStateChange {
    /// The job whose state changed.
    pub job_id: JobId,
    /// The job's chunk index.
    pub chunk_index: usize,
    /// State before the change.
    pub previous: QueueState,
    /// State after the change.
    pub current: QueueState,
}

/// Handle returned by [`QueueStateObserver::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&QueueStateChange) + Send + Sync>;

/// Paces polling by queue state and fans out state changes to subscribers.
pub struct QueueStateObserver {
    settings: PollSettings,
    subscribers: RwLock<BTreeMap<SubscriptionId, Callback>>,
    next_id: AtomicU64,
    events: SharedEventSink,
}

impl fmt::Debug for QueueStateObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStateObserver")
            .field("settings", &self.settings)
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for QueueStateObserver {
    fn default() -> Self {
        Self::new(PollSettings::default())
    }
}

impl QueueStateObserver {
    /// Create an observer with no subscribers.
    #[must_use]
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            events: events::default_sink(),
        }
    }

    /// Report state changes to `sink` as well as to subscribers.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    /// The cadence in force.
    #[must_use]
    pub const fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Delay before the next poll of a job in `state`.
    #[must_use]
    pub fn next_poll_delay(&self, state: QueueState, base_delay: Duration) -> Duration {
        match state {
            QueueState::Active => base_delay,
            QueueState::PausedRateLimit => scaled(base_delay, self.settings.rate_limit_multiplier),
            QueueState::PausedCapacity => scaled(base_delay, self.settings.capacity_multiplier),
            QueueState::Unknown => {
                warn!("Server reported an unrecognised queue state; pacing as active");
                base_delay
            }
        }
    }

    /// Register `callback` for every queue-state change.
    ///
    /// Callbacks run on the polling task and must not block.
    pub fn on_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&QueueStateChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver a change to the event sink and every subscriber.
    pub fn notify(&self, change: &QueueStateChange) {
        debug!(
            job_id = %change.job_id,
            chunk_index = change.chunk_index,
            previous = %change.previous,
            current = %change.current,
            "Queue state changed"
        );

        self.events.emit(
            &Event::new(events::QUEUE_STATE_CHANGED)
                .with("job_id", change.job_id.as_str())
                .with("chunk_index", change.chunk_index)
                .with("previous", change.previous.as_str())
                .with("current", change.current.as_str()),
        );

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use parking_lot::Mutex;

    fn observer() -> QueueStateObserver {
        QueueStateObserver::new(PollSettings::default()).with_event_sink(Arc::new(NoopEventSink))
    }

    fn change(current: QueueState) -> QueueStateChange {
        QueueStateChange {
            job_id: JobId::from("job-1"),
            chunk_index: 0,
            previous: QueueState::Active,
            current,
        }
    }

    #[test]
    fn test_next_poll_delay_by_state() {
        let observer = observer();
        let base = Duration::from_millis(500);

        assert_eq!(observer.next_poll_delay(QueueState::Active, base), base);
        assert_eq!(
            observer.next_poll_delay(QueueState::PausedRateLimit, base),
            Duration::from_secs(1)
        );
        assert_eq!(
            observer.next_poll_delay(QueueState::PausedCapacity, base),
            Duration::from_secs(2)
        );
        assert_eq!(observer.next_poll_delay(QueueState::Unknown, base), base);
    }

    #[test]
    fn test_poll_settings_validation() {
        assert!(PollSettings::default().validate().is_ok());

        let zero_interval = PollSettings {
            interval: Duration::ZERO,
            ..PollSettings::default()
        };
        assert!(zero_interval.validate().is_err());

        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let settings = PollSettings {
                rate_limit_multiplier: multiplier,
                ..PollSettings::default()
            };
            assert!(settings.validate().is_err(), "accepted {multiplier}");
        }

        let inverted = PollSettings {
            rate_limit_multiplier: 4.0,
            capacity_multiplier: 2.0,
            ..PollSettings::default()
        };
        assert!(matches!(inverted.validate(), Err(BatchError::InvalidInput(_))));
    }

    #[test]
    fn test_unusable_multiplier_paces_as_active() {
        let observer = QueueStateObserver::new(PollSettings {
            rate_limit_multiplier: -1.0,
            capacity_multiplier: f64::NAN,
            ..PollSettings::default()
        })
        .with_event_sink(Arc::new(NoopEventSink));
        let base = Duration::from_millis(500);

        assert_eq!(observer.next_poll_delay(QueueState::PausedRateLimit, base), base);
        assert_eq!(observer.next_poll_delay(QueueState::PausedCapacity, base), base);
    }

    #[test]
    fn test_wire_decoding() {
        assert_eq!(QueueState::from_wire("paused_capacity"), QueueState::PausedCapacity);
        assert_eq!(QueueState::from_wire("draining"), QueueState::Unknown);

        let state: QueueState = serde_json::from_str("\"maintenance\"").unwrap();
        assert_eq!(state, QueueState::Unknown);
        assert!(QueueState::PausedRateLimit.is_paused());
        assert!(!QueueState::Unknown.is_paused());
    }

    #[test]
    fn test_subscribers_receive_changes_until_unsubscribed() {
        let observer = observer();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = observer.on_change(move |change| sink.lock().push(change.current));

        observer.notify(&change(QueueState::PausedRateLimit));
        assert!(observer.unsubscribe(id));
        assert!(!observer.unsubscribe(id));
        observer.notify(&change(QueueState::PausedCapacity));

        assert_eq!(*seen.lock(), vec![QueueState::PausedRateLimit]);
        assert_eq!(observer.subscriber_count(), 0);
    }

    #[test]
    fn test_notify_emits_event() {
        let mut sink = crate::events::MockEventSink::new();
        sink.expect_emit()
            .withf(|event| {
                event.name == events::QUEUE_STATE_CHANGED
                    && event.field("current") == Some(&serde_json::Value::from("paused_capacity"))
            })
            .times(1)
            .return_const(());
        let observer = QueueStateObserver::default().with_event_sink(Arc::new(sink));

        observer.notify(&change(QueueState::PausedCapacity));
    }
}

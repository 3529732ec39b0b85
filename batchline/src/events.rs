//! Telemetry emission point.
//!
//! The core reports retry attempts, circuit transitions, queue-state changes
//! and combine completions as [`Event`]s handed to an injected [`EventSink`].
//! Delivery, batching and schema are the sink's concern.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

/// Emitted for every attempt, with its classification.
pub const RETRY_ATTEMPT: &str = "retry_attempt";
/// Emitted when a breaker trips to open.
pub const CIRCUIT_OPENED: &str = "circuit_opened";
/// Emitted when a breaker admits its half-open probe.
pub const CIRCUIT_HALF_OPEN: &str = "circuit_half_open";
/// Emitted when a breaker closes after a successful probe.
pub const CIRCUIT_CLOSED: &str = "circuit_closed";
/// Emitted when a job's reported queue state changes.
pub const QUEUE_STATE_CHANGED: &str = "queue_state_changed";
/// Emitted after a chunk is accepted by the server.
pub const JOB_SUBMITTED: &str = "job_submitted";
/// Emitted when a job reaches a terminal state.
pub const JOB_TERMINAL: &str = "job_terminal";
/// Emitted after per-chunk results are combined.
pub const COMBINE_COMPLETED: &str = "combine_completed";

/// A named telemetry event with structured fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event name, one of the constants in this module.
    pub name: &'static str,
    /// Structured payload.
    pub fields: BTreeMap<String, Value>,
}

impl Event {
    /// Create an event with no fields.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Look up a field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Receiver of telemetry events.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: &Event);
}

impl<F> EventSink for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn emit(&self, event: &Event) {
        self(event);
    }
}

/// Shared handle to an event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Default sink: writes every event to the `tracing` pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &Event) {
        let fields = serde_json::to_string(&event.fields).unwrap_or_default();
        match event.name {
            CIRCUIT_OPENED | CIRCUIT_CLOSED | COMBINE_COMPLETED => {
                info!(event = event.name, fields = %fields, "batchline event");
            }
            _ => {
                debug!(event = event.name, fields = %fields, "batchline event");
            }
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &Event) {}
}

/// The sink used when none is injected.
#[must_use]
pub fn default_sink() -> SharedEventSink {
    Arc::new(TracingEventSink)
}

#[cfg(feature = "otel-metrics")]
mod otel {
    use super::{Event, EventSink};
    use opentelemetry::metrics::{Counter, Meter};
    use opentelemetry::KeyValue;

    /// OpenTelemetry sink counting events by name.
    pub struct MetricsEventSink {
        /// Event counter.
        events: Counter<u64>,
    }

    impl MetricsEventSink {
        /// Create a sink recording into `meter`.
        #[must_use]
        pub fn new(meter: &Meter) -> Self {
            Self {
                events: meter
                    .u64_counter("batchline.events")
                    .with_description("Number of batchline lifecycle events")
                    .build(),
            }
        }
    }

    impl EventSink for MetricsEventSink {
        fn emit(&self, event: &Event) {
            let mut attributes = vec![KeyValue::new("event", event.name)];
            if let Some(classification) = event.field("classification").and_then(|v| v.as_str()) {
                attributes.push(KeyValue::new("classification", classification.to_string()));
            }
            self.events.add(1, &attributes);
        }
    }
}

#[cfg(feature = "otel-metrics")]
pub use otel::MetricsEventSink;

//! Logging and telemetry setup
//!
//! Installs a `tracing` subscriber for the whole process and picks the
//! [`EventSink`](crate::events::EventSink) lifecycle events are delivered to.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::events::{NoopEventSink, SharedEventSink, TracingEventSink};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Service name attached to OpenTelemetry instruments
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Log output format
    pub format: LogFormat,
    /// Record lifecycle events as OpenTelemetry metrics (`otel-metrics` feature)
    pub metrics_enabled: bool,
    /// Log lifecycle events through `tracing`
    pub tracing_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "batchline".to_string(),
            default_filter: if cfg!(debug_assertions) {
                "debug,batchline=trace".to_string()
            } else {
                "info".to_string()
            },
            format: LogFormat::default(),
            metrics_enabled: false,
            tracing_enabled: false,
        }
    }
}

impl ObservabilityConfig {
    /// Create a config for `service_name` with the defaults.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Record lifecycle events as metrics.
    #[must_use]
    pub fn with_metrics(mut self) -> Self {
        self.metrics_enabled = true;
        self
    }

    /// Set the log format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log lifecycle events.
    #[must_use]
    pub fn with_tracing(mut self) -> Self {
        self.tracing_enabled = true;
        self
    }

    /// The event sink this configuration selects.
    ///
    /// Metrics take precedence over logging when both are enabled and the
    /// `otel-metrics` feature is compiled in. With neither, events are dropped.
    #[must_use]
    pub fn event_sink(&self) -> SharedEventSink {
        #[cfg(feature = "otel-metrics")]
        {
            if self.metrics_enabled {
                let scope =
                    opentelemetry::InstrumentationScope::builder(self.service_name.clone()).build();
                let meter = opentelemetry::global::meter_with_scope(scope);
                return Arc::new(crate::events::MetricsEventSink::new(&meter));
            }
        }

        if self.tracing_enabled {
            Arc::new(TracingEventSink)
        } else {
            Arc::new(NoopEventSink)
        }
    }
}

/// Initialize logging with the default configuration.
///
/// # Example
///
/// ```rust,no_run
/// # fn main() -> anyhow::Result<()> {
/// batchline::observability::init()?;
/// tracing::info!("Trainer started");
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init() -> anyhow::Result<()> {
    init_with(&ObservabilityConfig::default())
}

/// Initialize logging with `config`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_with(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "batchline");
        assert!(!config.metrics_enabled);
        assert!(!config.tracing_enabled);
    }

    #[test]
    fn test_builder() {
        let config = ObservabilityConfig::new("trainer")
            .with_metrics()
            .with_format(LogFormat::Json)
            .with_tracing();

        assert_eq!(config.service_name, "trainer");
        assert!(config.metrics_enabled);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.tracing_enabled);
    }

    #[test]
    fn test_event_sink_selection_does_not_panic() {
        let sink = ObservabilityConfig::default().with_tracing().event_sink();
        sink.emit(&Event::new(crate::events::JOB_SUBMITTED));
        let sink = ObservabilityConfig::default().event_sink();
        sink.emit(&Event::new(crate::events::JOB_SUBMITTED));
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init();
        assert!(init().is_err());
    }
}

//! Configuration management
//!
//! Settings are loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `BATCHLINE_` prefix, `__` for nesting)
//! 2. `./config.toml` (development)
//! 3. `~/.config/batchline/{service}/config.toml` (user config, XDG)
//! 4. `/etc/batchline/{service}/config.toml` (system config)
//! 5. Hardcoded defaults (fallback)
//!
//! Durations are stored as integer milliseconds and converted to the runtime
//! types ([`RetryPolicy`], [`CircuitBreakerConfig`], [`PollSettings`],
//! [`ChunkLimits`]) with the `to_*` helpers.
//!
//! # Example Configuration
//!
//! ```toml
//! [retry]
//! max_attempts = 10
//! base_delay_ms = 500
//! max_delay_ms = 8000
//! jitter_fraction = 0.25
//! progress_timeout_ms = 1800000
//! max_concurrent_attempts = 64
//!
//! [chunking]
//! max_items_per_chunk = 128
//! max_weight_units_per_chunk = 500000
//! empty_batch = "no_op"
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_ms = 30000
//!
//! [polling]
//! interval_ms = 1000
//! rate_limit_multiplier = 2.0
//! capacity_multiplier = 4.0
//! await_timeout_ms = 3600000
//! ```
//!
//! Environment example: `BATCHLINE_RETRY__MAX_ATTEMPTS=3`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::chunker::{ChunkLimits, EmptyBatchPolicy, DEFAULT_MAX_ITEMS_PER_CHUNK, DEFAULT_MAX_WEIGHT_UNITS_PER_CHUNK};
use crate::error::BatchResult;
use crate::queue_state::PollSettings;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "BATCHLINE_";

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempt cap; absent means retry until the progress timeout
    pub max_attempts: Option<u32>,
    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Ceiling on the un-jittered delay, in milliseconds
    pub max_delay_ms: u64,
    /// Relative jitter in `[0, 1]`
    pub jitter_fraction: f64,
    /// Time without a successful call before giving up, in milliseconds
    pub progress_timeout_ms: u64,
    /// Attempts in flight at once per policy
    pub max_concurrent_attempts: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

impl From<&RetryPolicy> for RetrySettings {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: crate::retry::duration_ms(policy.base_delay),
            max_delay_ms: crate::retry::duration_ms(policy.max_delay),
            jitter_fraction: policy.jitter_fraction,
            progress_timeout_ms: crate::retry::duration_ms(policy.progress_timeout),
            max_concurrent_attempts: policy.max_concurrent_attempts,
        }
    }
}

impl RetrySettings {
    /// The runtime policy.
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_fraction: self.jitter_fraction,
            progress_timeout: Duration::from_millis(self.progress_timeout_ms),
            max_concurrent_attempts: self.max_concurrent_attempts,
        }
    }
}

/// Chunking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Hard cap on items per chunk
    pub max_items_per_chunk: usize,
    /// Cap on summed weight units per chunk
    pub max_weight_units_per_chunk: usize,
    /// What an empty batch does
    pub empty_batch: EmptyBatchPolicy,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_items_per_chunk: DEFAULT_MAX_ITEMS_PER_CHUNK,
            max_weight_units_per_chunk: DEFAULT_MAX_WEIGHT_UNITS_PER_CHUNK,
            empty_batch: EmptyBatchPolicy::NoOp,
        }
    }
}

impl ChunkingSettings {
    /// The runtime limits.
    #[must_use]
    pub const fn to_limits(&self) -> ChunkLimits {
        ChunkLimits::new(self.max_items_per_chunk, self.max_weight_units_per_chunk)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe, in milliseconds
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            cooldown_ms: crate::retry::duration_ms(config.cooldown),
        }
    }
}

impl BreakerSettings {
    /// The runtime breaker configuration.
    #[must_use]
    pub const fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Delay between polls while the queue is active, in milliseconds
    pub interval_ms: u64,
    /// Interval multiplier while rate limited
    pub rate_limit_multiplier: f64,
    /// Interval multiplier while the server is over capacity
    pub capacity_multiplier: f64,
    /// Timeout for [`CombinedFutureHandle::wait_default`](crate::client::CombinedFutureHandle::wait_default), in milliseconds
    pub await_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        let settings = PollSettings::default();
        Self {
            interval_ms: crate::retry::duration_ms(settings.interval),
            rate_limit_multiplier: settings.rate_limit_multiplier,
            capacity_multiplier: settings.capacity_multiplier,
            await_timeout_ms: crate::retry::duration_ms(crate::client::DEFAULT_AWAIT_TIMEOUT),
        }
    }
}

impl PollingSettings {
    /// The runtime poll cadence.
    #[must_use]
    pub const fn to_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.interval_ms),
            rate_limit_multiplier: self.rate_limit_multiplier,
            capacity_multiplier: self.capacity_multiplier,
        }
    }

    /// Await timeout as a duration.
    #[must_use]
    pub const fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

/// Complete batchline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchlineConfig {
    /// Retry policy
    pub retry: RetrySettings,
    /// Chunk limits
    pub chunking: ChunkingSettings,
    /// Circuit breaker tuning
    pub breaker: BreakerSettings,
    /// Poll cadence
    pub polling: PollingSettings,
}

impl BatchlineConfig {
    /// Load configuration for a named service from the standard locations.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Default configuration cannot be serialized to TOML
    /// - A configuration file contains invalid TOML syntax
    /// - Configuration values fail type conversion
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use batchline::config::BatchlineConfig;
    ///
    /// # fn example() -> anyhow::Result<()> {
    /// let config = BatchlineConfig::load_for_service("trainer")?;
    /// let policy = config.retry.to_policy();
    /// # Ok(())
    /// # }
    /// ```
    pub fn load_for_service(service_name: &str) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Toml::string(&toml::to_string(&Self::default())?));

        let system_config = PathBuf::from("/etc/batchline")
            .join(service_name)
            .join("config.toml");
        if system_config.exists() {
            figment = figment.merge(Toml::file(&system_config));
        }

        let user_config = Self::recommended_path(service_name);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }

        let local_config = PathBuf::from("./config.toml");
        if local_config.exists() {
            figment = figment.merge(Toml::file(&local_config));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(true));

        Ok(figment.extract()?)
    }

    /// Load configuration from one file, with environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file contains invalid TOML or values fail
    /// type conversion.
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = Figment::new()
            .merge(Toml::string(&toml::to_string(&Self::default())?))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(true))
            .extract()?;

        Ok(config)
    }

    /// XDG config path for a service: `~/.config/batchline/{service}/config.toml`.
    #[must_use]
    pub fn recommended_path(service_name: &str) -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("./config.toml"),
            |config_dir| {
                config_dir
                    .join("batchline")
                    .join(service_name)
                    .join("config.toml")
            },
        )
    }

    /// Create the config directory for a service and return the file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create_config_dir(service_name: &str) -> anyhow::Result<PathBuf> {
        let config_path = Self::recommended_path(service_name);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(config_path)
    }

    /// The process-wide breaker registry for the `[breaker]` settings.
    ///
    /// Every configuration with the same breaker settings gets the same
    /// registry, so clients of one endpoint share their breaker.
    #[must_use]
    pub fn breaker_registry(&self) -> Arc<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::shared(self.breaker.to_config())
    }

    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`](crate::error::BatchError::InvalidInput)
    /// for unusable chunk limits, retry settings or poll cadence.
    pub fn validate(&self) -> BatchResult<()> {
        self.chunking.to_limits().validate()?;
        self.retry.to_policy().validate()?;
        self.polling.to_settings().validate()?;
        if self.polling.await_timeout_ms == 0 {
            return Err(crate::error::BatchError::InvalidInput(
                "await_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BatchlineConfig::default();
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.max_delay_ms, 8000);
        assert_eq!(config.retry.progress_timeout_ms, 30 * 60 * 1000);
        assert_eq!(config.chunking.max_items_per_chunk, 128);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.polling.interval_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settings_convert_to_runtime_types() {
        let config = BatchlineConfig::default();
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert_eq!(config.breaker.to_config(), CircuitBreakerConfig::default());
        assert_eq!(config.polling.to_settings(), PollSettings::default());
        assert_eq!(config.chunking.to_limits(), ChunkLimits::default());
    }

    #[test]
    fn test_recommended_path() {
        let path = BatchlineConfig::recommended_path("test-app");
        let path = path.to_str().unwrap();
        assert!(path.contains("test-app"));
        assert!(path.contains("batchline"));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let config = BatchlineConfig::load_from("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config.chunking.max_weight_units_per_chunk, 500_000);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[retry]
max_attempts = 4
base_delay_ms = 250

[chunking]
max_items_per_chunk = 64
empty_batch = "reject"

[polling]
rate_limit_multiplier = 3.0
"#,
        )
        .unwrap();

        let config = BatchlineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, Some(4));
        assert_eq!(config.retry.to_policy().base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay_ms, 8000);
        assert_eq!(config.chunking.max_items_per_chunk, 64);
        assert_eq!(config.chunking.empty_batch, EmptyBatchPolicy::Reject);
        assert!((config.polling.rate_limit_multiplier - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_breaker_registry_uses_settings() {
        let mut config = BatchlineConfig::default();
        config.breaker.failure_threshold = 2;
        config.breaker.cooldown_ms = 1500;

        let registry = config.breaker_registry();
        let breaker = registry.breaker(&crate::breaker::BreakerKey::new("configured"));
        assert_eq!(breaker.config().failure_threshold, 2);
        assert_eq!(breaker.config().cooldown, Duration::from_millis(1500));

        assert!(Arc::ptr_eq(&registry, &config.clone().breaker_registry()));
        assert!(Arc::ptr_eq(
            &BatchlineConfig::default().breaker_registry(),
            &CircuitBreakerRegistry::global()
        ));
    }

    #[test]
    fn test_validate_rejects_unusable_polling() {
        let mut config = BatchlineConfig::default();
        config.polling.rate_limit_multiplier = -1.0;
        assert!(config.validate().is_err());

        let mut config = BatchlineConfig::default();
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BatchlineConfig::default();
        config.polling.capacity_multiplier = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = BatchlineConfig::default();
        config.chunking.max_items_per_chunk = 0;
        assert!(config.validate().is_err());
    }
}

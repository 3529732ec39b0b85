//! Configuration loading from files and the environment

use std::io::Write;
use std::time::Duration;

use batchline::chunker::EmptyBatchPolicy;
use batchline::config::BatchlineConfig;

// Environment variables are process-wide, so everything touching them lives in
// this one test.
#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[retry]
max_attempts = 10
max_delay_ms = 4000

[breaker]
failure_threshold = 8

[polling]
interval_ms = 250
await_timeout_ms = 60000
"#,
    )
    .unwrap();

    std::env::set_var("BATCHLINE_RETRY__MAX_ATTEMPTS", "3");
    std::env::set_var("BATCHLINE_CHUNKING__EMPTY_BATCH", "reject");
    let config = BatchlineConfig::load_from(file.path());
    std::env::remove_var("BATCHLINE_RETRY__MAX_ATTEMPTS");
    std::env::remove_var("BATCHLINE_CHUNKING__EMPTY_BATCH");
    let config = config.unwrap();

    assert_eq!(config.retry.max_attempts, Some(3));
    assert_eq!(config.retry.to_policy().max_delay, Duration::from_secs(4));
    assert_eq!(config.chunking.empty_batch, EmptyBatchPolicy::Reject);
    assert_eq!(config.breaker.to_config().failure_threshold, 8);
    assert_eq!(config.polling.to_settings().interval, Duration::from_millis(250));
    assert_eq!(config.polling.await_timeout(), Duration::from_secs(60));
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_file_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[retry]\nbase_delay_ms = \"soon\"\n").unwrap();

    assert!(BatchlineConfig::load_from(file.path()).is_err());
}

#[test]
fn test_out_of_range_jitter_fails_validation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[retry]\njitter_fraction = 2.0\n").unwrap();

    let config = BatchlineConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

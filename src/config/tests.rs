use super::*;
use serial_test::serial;
use std::env;

// These tests modify global environment variables and use #[serial] to ensure
// they run sequentially, preventing interference between parallel tests.

fn cleanup_test_env() {
    env::remove_var("CAPSTAN_DATA_DIR");
    env::remove_var("CAPSTAN_DB_PATH");
    env::remove_var("CAPSTAN_LOG_DIR");
    env::remove_var("CAPSTAN_API_HOST");
    env::remove_var("CAPSTAN_API_PORT");
    env::remove_var("CAPSTAN_CONCURRENCY");
    env::remove_var("CAPSTAN_BREAKER_THRESHOLD");
    env::remove_var("CAPSTAN_BREAKER_COOLDOWN_SECS");
    env::remove_var("CAPSTAN_RETRY_ATTEMPTS");
    env::remove_var("CAPSTAN_RETRY_BASE_DELAY_MS");
    env::remove_var("CAPSTAN_TIMEOUT_FAST_SECS");
    env::remove_var("CAPSTAN_MONITOR_INTERVAL_SECS");
}

#[test]
#[serial]
fn defaults_apply_when_env_is_empty() {
    cleanup_test_env();
    env::set_var("CAPSTAN_DATA_DIR", "/tmp/capstan-test");

    let config = Config::load().unwrap();

    assert_eq!(config.data_dir, PathBuf::from("/tmp/capstan-test"));
    assert_eq!(config.db_path, PathBuf::from("/tmp/capstan-test/tasks.db"));
    assert_eq!(config.scheduler.concurrency, 4);
    assert_eq!(config.breaker.failure_threshold, 5);
    assert_eq!(config.breaker.cooldown, Duration::from_secs(60));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.timeouts.fast, Duration::from_secs(600));
    assert_eq!(config.timeouts.balanced, Duration::from_secs(1800));
    assert_eq!(config.timeouts.deep, Duration::from_secs(3600));

    cleanup_test_env();
}

#[test]
#[serial]
fn db_path_override_wins_over_data_dir() {
    cleanup_test_env();
    env::set_var("CAPSTAN_DATA_DIR", "/tmp/capstan-test");
    env::set_var("CAPSTAN_DB_PATH", "/var/lib/capstan/state.db");

    let config = Config::load().unwrap();
    assert_eq!(config.db_path, PathBuf::from("/var/lib/capstan/state.db"));

    cleanup_test_env();
}

#[test]
#[serial]
fn malformed_numeric_knob_fails_startup() {
    cleanup_test_env();
    env::set_var("CAPSTAN_DATA_DIR", "/tmp/capstan-test");
    env::set_var("CAPSTAN_CONCURRENCY", "four");

    let result = Config::load();
    match result {
        Err(CapstanError::ConfigurationError(msg)) => {
            assert!(msg.contains("CAPSTAN_CONCURRENCY"), "message was: {msg}");
        }
        other => panic!("expected ConfigurationError, got {other:?}"),
    }

    cleanup_test_env();
}

#[test]
#[serial]
fn zero_concurrency_is_rejected() {
    cleanup_test_env();
    env::set_var("CAPSTAN_DATA_DIR", "/tmp/capstan-test");
    env::set_var("CAPSTAN_CONCURRENCY", "0");

    assert!(Config::load().is_err());

    cleanup_test_env();
}

#[test]
fn rooted_at_keeps_everything_under_one_directory() {
    let config = Config::rooted_at("/tmp/elsewhere");
    assert_eq!(config.db_path, PathBuf::from("/tmp/elsewhere/tasks.db"));
    assert_eq!(config.log_dir, PathBuf::from("/tmp/elsewhere"));
}

#[test]
fn tier_timeouts_resolve_by_tier() {
    use crate::models::ModelTier;
    let config = Config::rooted_at("/tmp/x");
    assert_eq!(
        config.timeouts.for_tier(ModelTier::Fast),
        Duration::from_secs(600)
    );
    assert_eq!(
        config.timeouts.for_tier(ModelTier::Deep),
        Duration::from_secs(3600)
    );
}

use super::*;
use std::sync::Mutex;

/// Serializes the tests that touch process environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

unsafe fn clear_config_env() {
    unsafe {
        std::env::remove_var("PORT");
        std::env::remove_var("WS_KEEPALIVE_MS");
        std::env::remove_var("CONNECTION_INIT_TIMEOUT_MS");
        std::env::remove_var("SHUTDOWN_GRACE_MS");
        std::env::remove_var("APP_ENV");
    }
}

#[test]
fn defaults_match_constants() {
    let cfg = Config::default();
    assert_eq!(cfg.port, DEFAULT_PORT);
    assert_eq!(cfg.keepalive, Some(Duration::from_millis(12_000)));
    assert_eq!(cfg.connection_init_timeout, Duration::from_millis(3_000));
    assert_eq!(cfg.shutdown_grace, Duration::from_millis(5_000));
    assert!(!cfg.production);
}

#[test]
fn keepalive_disabled_for_zero_or_negative() {
    assert_eq!(keepalive_interval(0), None);
    assert_eq!(keepalive_interval(-1), None);
    assert_eq!(keepalive_interval(-12_000), None);
    assert_eq!(keepalive_interval(250), Some(Duration::from_millis(250)));
}

#[test]
fn env_parse_falls_back_on_garbage() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe { std::env::set_var("SUBWIRE_TEST_GARBAGE", "not-a-number") };
    assert_eq!(env_parse("SUBWIRE_TEST_GARBAGE", 7_u16), 7);
    unsafe { std::env::remove_var("SUBWIRE_TEST_GARBAGE") };
}

#[test]
fn from_env_with_clean_environment_yields_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe { clear_config_env() };

    let cfg = Config::from_env();
    assert_eq!(cfg, Config::default());
}

#[test]
fn from_env_reads_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    unsafe {
        clear_config_env();
        std::env::set_var("PORT", "8080");
        std::env::set_var("WS_KEEPALIVE_MS", "0");
        std::env::set_var("CONNECTION_INIT_TIMEOUT_MS", "50");
        std::env::set_var("SHUTDOWN_GRACE_MS", "100");
        std::env::set_var("APP_ENV", "production");
    }

    let cfg = Config::from_env();
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.keepalive, None);
    assert_eq!(cfg.connection_init_timeout, Duration::from_millis(50));
    assert_eq!(cfg.shutdown_grace, Duration::from_millis(100));
    assert!(cfg.production);

    unsafe { clear_config_env() };
}

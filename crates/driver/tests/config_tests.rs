//! Integration tests for configuration parsing
//!
//! Tests driver configuration loading, including:
//! - Minimal and full config files
//! - Duration and stall policy syntax
//! - Save/load round trips through the filesystem
//! - Invalid configuration handling

use driver::config::DriverConfig;
use driver::usb::StallPolicy;
use std::time::Duration;
use tempfile::tempdir;

const MINIMAL_CONFIG: &str = r#"
[driver]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"

[transfer]
bulk_timeout = "2s"
control_timeout = "500ms"
lock_wait = "1m"
max_transfer_size = 16384
control_max_transfer = 1024
max_buffer_size = 65536
stall_policy = "retry-once"

[usb]
interface = 1
filters = ["0x04f9:*", "0x1234:0x5678"]
"#;

fn parse(content: &str) -> DriverConfig {
    toml::from_str(content).expect("config should parse")
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_minimal_config_uses_defaults() {
    let config = parse(MINIMAL_CONFIG);
    assert_eq!(config.driver.log_level, "info");
    assert_eq!(config.transfer.bulk_timeout, Duration::from_secs(5));
    assert_eq!(config.transfer.control_timeout, Duration::from_secs(1));
    assert_eq!(config.transfer.lock_wait, Duration::from_secs(10));
    assert_eq!(config.transfer.stall_policy, StallPolicy::Surface);
    assert_eq!(config.usb.interface, 0);
    assert!(config.validate().is_ok());
}

#[test]
fn test_full_config() {
    let config = parse(FULL_CONFIG);
    assert_eq!(config.driver.log_level, "debug");
    assert_eq!(config.transfer.bulk_timeout, Duration::from_secs(2));
    assert_eq!(config.transfer.control_timeout, Duration::from_millis(500));
    assert_eq!(config.transfer.lock_wait, Duration::from_secs(60));
    assert_eq!(config.transfer.stall_policy, StallPolicy::RetryOnce);
    assert_eq!(config.usb.interface, 1);
    assert!(config.validate().is_ok());

    let settings = config.manager_settings().unwrap();
    assert_eq!(settings.extra_matches.len(), 2);
    assert_eq!(settings.limits.max_buffer_size, 65536);
    assert_eq!(settings.timeouts.control, Duration::from_millis(500));

    let options = config.open_options();
    assert_eq!(options.interface, 1);
    assert_eq!(options.max_transfer_size, 16384);
    assert_eq!(options.control_max_transfer, 1024);
}

#[test]
fn test_filters_extend_device_table() {
    let config = parse(FULL_CONFIG);
    let manager = driver::usb::LifecycleManager::new(config.manager_settings().unwrap());

    assert!(manager.accepts(0x21e1, 0x0001));
    assert!(manager.accepts(0x04f9, 0x0042));
    assert!(manager.accepts(0x1234, 0x5678));
    assert!(!manager.accepts(0x1234, 0x5679));
}

#[test]
fn test_empty_config_is_default() {
    let config = parse("");
    assert_eq!(config.driver.log_level, "info");
    assert!(config.validate().is_ok());
}

// ============================================================================
// Invalid Configuration
// ============================================================================

#[test]
fn test_invalid_duration_rejected() {
    let result: Result<DriverConfig, _> = toml::from_str(
        r#"
[transfer]
bulk_timeout = "soon"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_zero_duration_rejected() {
    let result: Result<DriverConfig, _> = toml::from_str(
        r#"
[transfer]
lock_wait = "0s"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_unknown_stall_policy_rejected() {
    let result: Result<DriverConfig, _> = toml::from_str(
        r#"
[transfer]
stall_policy = "ignore"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_invalid_filter_fails_validation() {
    let config = parse(
        r#"
[usb]
filters = ["*:0x1234"]
"#,
    );
    assert!(config.validate().is_err());
    assert!(config.manager_settings().is_err());
}

#[test]
fn test_transfer_larger_than_buffer_fails_validation() {
    let config = parse(
        r#"
[transfer]
max_transfer_size = 131072
max_buffer_size = 65536
"#,
    );
    assert!(config.validate().is_err());
}

// ============================================================================
// Filesystem
// ============================================================================

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let mut config = DriverConfig::default();
    config.transfer.bulk_timeout = Duration::from_millis(1500);
    config.transfer.stall_policy = StallPolicy::RetryOnce;
    config.usb.filters = vec!["0x04f9:*".to_string()];
    config.save(&path).unwrap();

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.transfer.bulk_timeout, Duration::from_millis(1500));
    assert_eq!(loaded.transfer.stall_policy, StallPolicy::RetryOnce);
    assert_eq!(loaded.usb.filters, vec!["0x04f9:*".to_string()]);
}

#[test]
fn test_load_rejects_invalid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("driver.toml");
    std::fs::write(&path, "[driver]\nlog_level = \"loud\"\n").unwrap();

    let err = DriverConfig::load(Some(path)).unwrap_err();
    assert!(err.to_string().contains("log level"));
}

#[test]
fn test_load_missing_file() {
    let dir = tempdir().unwrap();
    assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_default_path_location() {
    let path = DriverConfig::default_path();
    assert!(path.ends_with("caen-usb/driver.toml"));
}

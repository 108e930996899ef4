use super::*;
use crate::schema::RelayConfig;

#[test]
fn default_config_is_valid() {
    assert!(validate(&RelayConfig::default()).is_ok());
}

#[test]
fn ephemeral_port_is_allowed() {
    let mut config = RelayConfig::default();
    config.server.port = 0;
    assert!(validate(&config).is_ok());
}

#[test]
fn bad_bind_address_rejected() {
    let mut config = RelayConfig::default();
    config.server.bind = "localhost:80".into();
    let err = validate(&config).unwrap_err();
    assert!(err.to_string().contains("server.bind"));
}

#[test]
fn ws_path_must_be_absolute() {
    let mut config = RelayConfig::default();
    config.server.ws_path = "ws".into();
    let err = validate(&config).unwrap_err();
    assert!(err.to_string().contains("server.ws_path"));
}

#[test]
fn outbound_queue_range() {
    let mut config = RelayConfig::default();
    config.server.outbound_queue = 8;
    assert!(validate(&config).is_err());
    config.server.outbound_queue = 16;
    assert!(validate(&config).is_ok());
}

#[test]
fn store_timeouts_range() {
    let mut config = RelayConfig::default();
    config.store.write_timeout_ms = 10;
    config.store.retry_backoff_ms = 20_000;
    let msg = validate(&config).unwrap_err().to_string();
    assert!(msg.contains("store.write_timeout_ms = 10"));
    assert!(msg.contains("store.retry_backoff_ms = 20000"));
}

#[test]
fn all_errors_are_collected() {
    let mut config = RelayConfig::default();
    config.server.bind = "nope".into();
    config.server.ws_path = String::new();
    config.store.write_timeout_ms = 0;
    let msg = validate(&config).unwrap_err().to_string();
    assert_eq!(msg.matches("; ").count(), 2);
}

//! Full configuration validation.
//!
//! Each section has its own validator; this orchestrator calls them all
//! and collects errors into a single `ConfigError`.

mod helpers;

#[cfg(test)]
mod tests;

use std::net::IpAddr;

use crate::schema::RelayConfig;
use portal_common::ConfigError;

use helpers::validate_range;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &RelayConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_server(&mut errors, config);
    validate_store(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_server(errors: &mut Vec<String>, config: &RelayConfig) {
    if config.server.bind.parse::<IpAddr>().is_err() {
        errors.push(format!(
            "server.bind = {:?} is not an IP address",
            config.server.bind
        ));
    }
    if !config.server.ws_path.starts_with('/') {
        errors.push(format!(
            "server.ws_path = {:?} must start with '/'",
            config.server.ws_path
        ));
    }
    validate_range(
        errors,
        "server.outbound_queue",
        config.server.outbound_queue,
        16,
        65536,
    );
}

fn validate_store(errors: &mut Vec<String>, config: &RelayConfig) {
    validate_range(
        errors,
        "store.write_timeout_ms",
        config.store.write_timeout_ms,
        50,
        60_000,
    );
    validate_range(
        errors,
        "store.retry_backoff_ms",
        config.store.retry_backoff_ms,
        0,
        10_000,
    );
}

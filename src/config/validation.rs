//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds > 0)
//! - Check that addresses parse and backends are unique
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener has no bind address")]
    NoBindAddress,
    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),
    #[error("listener.max_connections must be greater than 0")]
    ZeroMaxConnections,
    #[error("no backends configured")]
    NoBackends,
    #[error("invalid backend address '{0}'")]
    InvalidBackendAddress(String),
    #[error("backend '{0}' is configured more than once")]
    DuplicateBackend(String),
    #[error("backend '{0}' must allow at least one connection")]
    ZeroBackendConnections(String),
    #[error("backend '{0}' has weight 0")]
    ZeroWeight(String),
    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),
    #[error("http.max_header_size ({max_header}) exceeds http.max_buffered_bytes ({max_buffered})")]
    HeaderLargerThanBuffer { max_header: usize, max_buffered: usize },
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_addresses.is_empty() {
        errors.push(ValidationError::NoBindAddress);
    }
    for addr in &config.listener.bind_addresses {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress(addr.clone()));
        }
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }
    let mut seen = HashSet::new();
    for backend in &config.backends {
        match backend.address.parse::<SocketAddr>() {
            Ok(addr) => {
                if !seen.insert(addr) {
                    errors.push(ValidationError::DuplicateBackend(backend.address.clone()));
                }
            }
            Err(_) => errors.push(ValidationError::InvalidBackendAddress(backend.address.clone())),
        }
        if backend.max_connections == 0 {
            errors.push(ValidationError::ZeroBackendConnections(backend.address.clone()));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::ZeroWeight(backend.address.clone()));
        }
    }

    let positive = [
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("timeouts.idle_ms", config.timeouts.idle_ms),
        ("timeouts.keep_alive_ms", config.timeouts.keep_alive_ms),
        ("timeouts.sweep_interval_ms", config.timeouts.sweep_interval_ms),
        ("pool.idle_timeout_secs", config.pool.idle_timeout_secs),
        ("pool.max_lifetime_secs", config.pool.max_lifetime_secs),
        ("pool.sweep_interval_secs", config.pool.sweep_interval_secs),
        ("health_check.interval_secs", config.health_check.interval_secs),
        ("health_check.timeout_ms", config.health_check.timeout_ms),
        ("health_check.unhealthy_threshold", config.health_check.unhealthy_threshold as u64),
        ("health_check.healthy_threshold", config.health_check.healthy_threshold as u64),
        ("http.read_buffer_size", config.http.read_buffer_size as u64),
        ("http.max_header_size", config.http.max_header_size as u64),
    ];
    for (name, value) in positive {
        if value == 0 {
            errors.push(ValidationError::ZeroValue(name));
        }
    }

    if config.http.max_header_size > config.http.max_buffered_bytes {
        errors.push(ValidationError::HeaderLargerThanBuffer {
            max_header: config.http.max_header_size,
            max_buffered: config.http.max_buffered_bytes,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

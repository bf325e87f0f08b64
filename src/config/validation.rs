//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, ports numeric)
//! - Check paired settings (CA cert and key set together)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if let Some(chain) = &config.chain.proxy {
        if let Err(message) = validate_host_and_port(chain) {
            errors.push(ValidationError::new("chain.proxy", message));
        }
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.shutdown_grace_secs == 0 {
        errors.push(ValidationError::new("timeouts.shutdown_grace_secs", "must be greater than 0"));
    }

    for (i, user) in config.auth.users.iter().enumerate() {
        if user.username.is_empty() {
            errors.push(ValidationError::new(format!("auth.users[{i}].username"), "must not be empty"));
        } else if user.username.contains(':') {
            errors.push(ValidationError::new(format!("auth.users[{i}].username"), "must not contain ':'"));
        }
    }

    if config.mitm.ca_cert_path.is_some() != config.mitm.ca_key_path.is_some() {
        errors.push(ValidationError::new(
            "mitm.ca_cert_path",
            "ca_cert_path and ca_key_path must be set together",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "must be a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that a value has the `host:port` shape with a numeric port.
pub fn validate_host_and_port(value: &str) -> Result<(), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not host:port", value))?;
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", value));
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| format!("'{}' has an invalid port", value))
}

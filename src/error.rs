//! Error taxonomy for the proxy.
//!
//! Per-connection errors never escape their connection task: they are
//! either rendered as a failure response to the client or logged at the
//! connection's error boundary. Only bind failures are fatal, and only at
//! start time.

use std::time::Duration;
use thiserror::Error;

use crate::cert::CertificateError;
use crate::config::loader::ConfigError;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration call (e.g. adding filters after start).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Host name resolution failed.
    #[error("Could not resolve '{host}': {message}")]
    Resolution { host: String, message: String },

    /// Credentials were missing or rejected.
    #[error("Proxy authorization required")]
    AuthorizationDenied,

    /// Outbound TCP connect failed (origin or chain proxy).
    #[error("Failed to connect to '{addr}': {source}")]
    OutboundConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound connect did not complete in time.
    #[error("Connect to '{addr}' timed out after {timeout:?}")]
    OutboundTimeout { addr: String, timeout: Duration },

    /// Outbound leg failed while relaying.
    #[error("Outbound I/O error on '{addr}': {message}")]
    OutboundIo { addr: String, message: String },

    /// Origin closed the connection before a complete response.
    #[error("Upstream '{addr}' closed the connection")]
    OriginClosed { addr: String },

    /// The chain proxy refused a CONNECT.
    #[error("Chain proxy '{addr}' refused tunnel: {status_line}")]
    ChainRejected { addr: String, status_line: String },

    /// Response body exceeded a filter's buffer limit.
    #[error("Response body exceeded filter buffer of {limit} bytes")]
    FilterOverflow { limit: usize },

    /// Leaf certificate could not be minted.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed request from the client.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Graceful close did not finish in time.
    #[error("Shutdown grace period of {0:?} elapsed")]
    ShutdownTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl ProxyError {
    /// Short machine-readable tag, used for the `X-Proxy-Error` header and
    /// metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Configuration(_) | ProxyError::Config(_) => "configuration",
            ProxyError::Resolution { .. } => "dns-resolution",
            ProxyError::AuthorizationDenied => "authorization",
            ProxyError::OutboundConnect { .. } => "connect-failed",
            ProxyError::OutboundTimeout { .. } => "connect-timeout",
            ProxyError::OutboundIo { .. } | ProxyError::OriginClosed { .. } => "upstream-closed",
            ProxyError::ChainRejected { .. } => "chain-rejected",
            ProxyError::FilterOverflow { .. } => "filter-overflow",
            ProxyError::Certificate(_) => "certificate",
            ProxyError::Tls(_) => "tls",
            ProxyError::Bind { .. } => "bind",
            ProxyError::InvalidRequest(_) => "invalid-request",
            ProxyError::ShutdownTimeout(_) => "shutdown-timeout",
            ProxyError::Io(_) | ProxyError::Http(_) => "io",
        }
    }
}

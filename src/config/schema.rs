//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind mode, port, limits).
    pub listener: ListenerConfig,

    /// Upstream chain proxy.
    pub chain: ChainConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Proxy authentication settings.
    pub auth: AuthConfig,

    /// TLS interception settings.
    pub mitm: MitmConfig,

    /// Response filter behaviour.
    pub filters: FilterConfig,

    /// Tokio runtime sizing.
    pub runtime: RuntimeConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Which local address the listening socket binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BindMode {
    /// `127.0.0.1:<port>` only.
    LoopbackOnly,
    /// `0.0.0.0:<port>`.
    #[default]
    AnyAddress,
    /// The address the local host name resolves to; wildcard if resolution fails.
    ResolvedLocalHost,
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindMode::LoopbackOnly => "loopback-only",
            BindMode::AnyAddress => "any-address",
            BindMode::ResolvedLocalHost => "resolved-local-host",
        };
        f.write_str(s)
    }
}

impl FromStr for BindMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loopback-only" | "loopback" => Ok(BindMode::LoopbackOnly),
            "any-address" | "any" => Ok(BindMode::AnyAddress),
            "resolved-local-host" | "local-host" => Ok(BindMode::ResolvedLocalHost),
            other => Err(format!("unknown bind mode '{}'", other)),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind mode used by `start()` when none is given explicitly.
    pub bind_mode: BindMode,

    /// Listening port (0 = ephemeral).
    pub port: u16,

    /// Host name resolved by [`BindMode::ResolvedLocalHost`].
    pub local_hostname: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_mode: BindMode::AnyAddress,
            port: 8080,
            local_hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            max_connections: 10_000,
        }
    }
}

/// Upstream chain proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ChainConfig {
    /// Upstream proxy as `host:port`. When set, all outbound traffic goes there.
    pub proxy: Option<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outbound connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// How long `stop()` waits for connections to close gracefully.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            shutdown_grace_secs: 6,
        }
    }
}

/// Proxy authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Realm advertised in the `Proxy-Authenticate` challenge.
    pub realm: String,

    /// Close the client connection after a 407 instead of keeping it open.
    pub close_on_denial: bool,

    /// Basic credentials accepted by the proxy.
    pub users: Vec<UserCredentials>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: "forward-proxy".to_string(),
            close_on_denial: false,
            users: Vec::new(),
        }
    }
}

/// A username/password pair for Basic proxy authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// What to do when a leaf certificate cannot be minted for a CONNECT host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateFailurePolicy {
    /// Relay the tunnel opaquely without interception.
    #[default]
    Tunnel,
    /// Answer the CONNECT with a failure response.
    Reject,
}

/// TLS interception configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MitmConfig {
    /// Intercept CONNECT tunnels with minted certificates.
    pub enabled: bool,

    /// CA certificate (PEM). Generated and written here when absent.
    pub ca_cert_path: Option<String>,

    /// CA private key (PEM).
    pub ca_key_path: Option<String>,

    /// Common name of a generated root.
    pub ca_common_name: String,

    pub on_certificate_failure: CertificateFailurePolicy,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            ca_key_path: None,
            ca_common_name: "Forward Proxy Root CA".to_string(),
            on_certificate_failure: CertificateFailurePolicy::Tunnel,
        }
    }
}

/// What to do when a filtered response exceeds the filter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Answer with a failure response.
    #[default]
    Reject,
    /// Forward the original response unfiltered.
    PassThrough,
}

/// Response filter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub overflow_policy: OverflowPolicy,
}

/// Tokio runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for connection processing (0 = tokio default).
    pub worker_threads: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_launcher() {
        let config = ProxyConfig::default();
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.listener.bind_mode, BindMode::AnyAddress);
        assert_eq!(config.timeouts.shutdown_grace(), Duration::from_secs(6));
        assert!(config.chain.proxy.is_none());
        assert!(!config.mitm.enabled);
    }

    #[test]
    fn bind_mode_parses_kebab_case() {
        assert_eq!("loopback-only".parse::<BindMode>(), Ok(BindMode::LoopbackOnly));
        assert_eq!("resolved-local-host".parse::<BindMode>(), Ok(BindMode::ResolvedLocalHost));
        assert!("everywhere".parse::<BindMode>().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listener]
            bind_mode = "loopback-only"
            port = 3128

            [chain]
            proxy = "upstream:8080"

            [filters]
            overflow_policy = "pass-through"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind_mode, BindMode::LoopbackOnly);
        assert_eq!(config.listener.port, 3128);
        assert_eq!(config.listener.max_connections, 10_000);
        assert_eq!(config.chain.proxy.as_deref(), Some("upstream:8080"));
        assert_eq!(config.filters.overflow_policy, OverflowPolicy::PassThrough);
        assert_eq!(config.timeouts.connect_secs, 10);
    }
}

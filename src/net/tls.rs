//! TLS plumbing shared by interception and upstream connections.
//!
//! Every config is built against the ring provider explicitly so the crate
//! never depends on a process-wide default being installed.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::ProxyError;

/// Intercepted sessions are relayed as HTTP/1.1 only.
const HTTP11_ALPN: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server config presenting `chain` (leaf first) for intercepted tunnels.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, ProxyError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// Connector for upstream origins, trusting the system roots plus any
/// additional roots supplied.
pub fn upstream_connector(
    extra_roots: &[CertificateDer<'static>],
) -> Result<TlsConnector, ProxyError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        debug!(error = %err, "Skipping unreadable native certificate");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            debug!(error = %e, "Skipping invalid native certificate");
        }
    }
    for cert in extra_roots {
        roots.add(cert.clone())?;
    }

    if roots.is_empty() {
        warn!("No trusted root certificates available, upstream TLS verification will fail");
    } else {
        debug!(roots = roots.len(), "Loaded upstream trust roots");
    }

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// SNI / verification name for a destination host. IPv6 brackets are removed.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name: {}", host)))
}

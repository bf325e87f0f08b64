//! CONNECT tunnels once the client side has been upgraded.

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::cert::LeafCertificate;
use crate::error::ProxyError;
use crate::net::tls;
use crate::observability::metrics;

/// How a tunnel is carried after the 200 reply.
pub enum TunnelMode {
    /// Bytes are copied verbatim in both directions.
    Opaque,
    /// The client's TLS is terminated with this leaf and the decrypted HTTP
    /// is proxied request by request.
    Intercept(Arc<LeafCertificate>),
}

impl TunnelMode {
    pub fn label(&self) -> &'static str {
        match self {
            TunnelMode::Opaque => "opaque",
            TunnelMode::Intercept(_) => "intercept",
        }
    }
}

/// Copy bytes both ways until either side closes. Returns bytes written
/// (client to origin, origin to client).
pub async fn relay_opaque<O>(upgraded: Upgraded, outbound: &mut O) -> std::io::Result<(u64, u64)>
where
    O: AsyncRead + AsyncWrite + Unpin,
{
    metrics::record_tunnel("opaque");
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, outbound).await
}

/// Terminate the client's TLS session with a minted leaf.
pub async fn accept_intercepted(
    upgraded: Upgraded,
    leaf: &LeafCertificate,
) -> Result<TlsStream<TokioIo<Upgraded>>, ProxyError> {
    metrics::record_tunnel("intercept");
    tls::acceptor(leaf.server_config())
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("client handshake for {} failed: {}", leaf.host(), e)))
}

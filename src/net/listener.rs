//! TCP listener with bind-mode selection and backpressure.
//!
//! # Responsibilities
//! - Turn a [`BindMode`] into a concrete socket address
//! - Fall back to the wildcard address when the local host name does not resolve
//! - Enforce `max_connections` via a semaphore

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{BindMode, ListenerConfig};
use crate::error::ProxyError;

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, `accept` waits until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind according to `mode`. Only a failure to bind the final address is
    /// an error; a failed host name lookup degrades to the wildcard address.
    pub async fn bind(mode: BindMode, config: &ListenerConfig) -> Result<Self, ProxyError> {
        let addr = resolve_bind_addr(mode, config.port, &config.local_hostname).await;

        let inner = TcpListener::bind(addr).await.map_err(|source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let local_addr = inner.local_addr()?;
        tracing::info!(
            address = %local_addr,
            bind_mode = %mode,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The returned permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection limit closed"))?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot. Dropping it releases the slot, even if the connection
/// task panicked.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Socket address for a bind mode.
pub async fn resolve_bind_addr(mode: BindMode, port: u16, local_hostname: &str) -> SocketAddr {
    let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    match mode {
        BindMode::LoopbackOnly => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        BindMode::AnyAddress => wildcard,
        BindMode::ResolvedLocalHost => match lookup_host((local_hostname, port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    tracing::error!(
                        hostname = %local_hostname,
                        "Local host name resolved to no addresses, binding wildcard"
                    );
                    wildcard
                }
            },
            Err(e) => {
                tracing::error!(
                    hostname = %local_hostname,
                    error = %e,
                    "Could not resolve local host name, binding wildcard"
                );
                wildcard
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_config(hostname: &str) -> ListenerConfig {
        ListenerConfig {
            port: 0,
            local_hostname: hostname.to_string(),
            max_connections: 2,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn loopback_mode_binds_loopback() {
        let addr = resolve_bind_addr(BindMode::LoopbackOnly, 3128, "ignored").await;
        assert_eq!(addr, "127.0.0.1:3128".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn any_mode_binds_wildcard() {
        let addr = resolve_bind_addr(BindMode::AnyAddress, 3128, "ignored").await;
        assert!(addr.ip().is_unspecified());
    }

    #[tokio::test]
    async fn unresolvable_host_falls_back_to_wildcard() {
        let listener = Listener::bind(
            BindMode::ResolvedLocalHost,
            &listener_config("no-such-host.invalid"),
        )
        .await
        .unwrap();
        assert!(listener.local_addr().unwrap().ip().is_unspecified());
    }

    #[tokio::test]
    async fn permits_track_accepted_connections() {
        let listener = Listener::bind(BindMode::LoopbackOnly, &listener_config("localhost"))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(listener.available_permits(), 2);

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }
}

//! Per-connection request pipeline.
//!
//! # Responsibilities
//! - Drive one client connection through its states
//! - Gate every request on the authorization chain before anything goes out
//! - Hand plain requests to the relay and CONNECT requests to a tunnel task
//! - Turn every failure into a response; never let one escape the connection
//!
//! # Data Flow
//! ```text
//! AwaitingRequest
//!     → Authorizing ──denied──→ 407 → AwaitingRequest (or Closing)
//!     → Routing
//!     → Relaying ──→ AwaitingRequest (keep-alive) or Closing
//!     → Tunneling (CONNECT: 200, then opaque or intercepted)
//! ```
//!
//! # Design Decisions
//! - hyper's HTTP/1.1 server serializes requests per connection, so
//!   responses go out in receipt order
//! - The outbound leg lives in the pipeline and is dropped with it
//! - Decrypted traffic of an intercepted tunnel runs through a nested
//!   pipeline bound to the tunnel's destination, without re-authorization

use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn, Instrument};

use super::request::{proxy_credentials, wants_close};
use super::response::{connect_established, error_response, proxy_auth_required, with_close, ProxyBody};
use crate::auth::AuthorizationGate;
use crate::cert::{CertificateAuthority, LeafCertificate};
use crate::config::CertificateFailurePolicy;
use crate::error::ProxyError;
use crate::net::{CloseSignal, ConnectionGuard};
use crate::observability::{logging, metrics};
use crate::relay::tunnel::{accept_intercepted, relay_opaque};
use crate::relay::{Destination, OutboundLeg, RelayManager, Scheme, TunnelMode};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    AwaitingRequest,
    Authorizing,
    Routing,
    Relaying,
    Tunneling,
    Closing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::AwaitingRequest => "awaiting-request",
            PipelineState::Authorizing => "authorizing",
            PipelineState::Routing => "routing",
            PipelineState::Relaying => "relaying",
            PipelineState::Tunneling => "tunneling",
            PipelineState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Everything a pipeline needs from the server, frozen at start.
pub struct PipelineContext {
    pub gate: Arc<AuthorizationGate>,
    pub relay: Arc<RelayManager>,
    pub authority: Option<Arc<CertificateAuthority>>,
    pub realm: String,
    pub close_on_denial: bool,
    pub certificate_failure: CertificateFailurePolicy,
}

pub struct InboundPipeline {
    ctx: Arc<PipelineContext>,
    guard: Arc<ConnectionGuard>,
    peer_addr: SocketAddr,
    /// Set for the decrypted side of an intercepted tunnel.
    intercepted: Option<Destination>,
    leg: Mutex<Option<OutboundLeg>>,
    state: std::sync::Mutex<PipelineState>,
}

impl InboundPipeline {
    pub fn new(ctx: Arc<PipelineContext>, guard: Arc<ConnectionGuard>, peer_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            guard,
            peer_addr,
            intercepted: None,
            leg: Mutex::new(None),
            state: std::sync::Mutex::new(PipelineState::AwaitingRequest),
        })
    }

    fn intercepting(&self, destination: Destination, leg: Option<OutboundLeg>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::clone(&self.ctx),
            guard: Arc::clone(&self.guard),
            peer_addr: self.peer_addr,
            intercepted: Some(destination),
            leg: Mutex::new(leg),
            state: std::sync::Mutex::new(PipelineState::AwaitingRequest),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PipelineState::Closing)
    }

    fn transition(&self, next: PipelineState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                trace!(from = %*state, to = %next, "Pipeline transition");
                *state = next;
            }
        }
    }

    /// Serve HTTP/1.1 on `io` until the client leaves or the connection is
    /// told to close.
    pub async fn serve<I>(self: Arc<Self>, io: I, mut close_rx: watch::Receiver<CloseSignal>)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let pipeline = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let pipeline = Arc::clone(&pipeline);
            async move { Ok::<_, Infallible>(pipeline.handle(req).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        let mut draining = false;
        let mut watching = true;
        let initial = *close_rx.borrow_and_update();

        let mut signal = initial;
        loop {
            match signal {
                CloseSignal::Force => {
                    debug!("Connection force-closed");
                    break;
                }
                CloseSignal::Graceful if !draining => {
                    draining = true;
                    self.transition(PipelineState::Closing);
                    conn.as_mut().graceful_shutdown();
                }
                _ => {}
            }

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Connection ended with error");
                    }
                    break;
                }
                changed = close_rx.changed(), if watching => {
                    signal = match changed {
                        Ok(()) => *close_rx.borrow_and_update(),
                        Err(_) => {
                            watching = false;
                            CloseSignal::Graceful
                        }
                    };
                }
            }
        }

        self.transition(PipelineState::Closing);
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let start = Instant::now();
        let span = tracing::info_span!(
            "request",
            request_id = %logging::correlation_id(),
            method = %req.method(),
            target = %req.uri(),
        );

        async move {
            self.transition(PipelineState::Authorizing);
            if self.intercepted.is_none() && !self.ctx.gate.is_authorized(proxy_credentials(&req)) {
                metrics::record_auth_denied();
                metrics::record_request("denied", start);
                info!(peer_addr = %self.peer_addr, "Proxy authorization denied");
                self.transition(if self.ctx.close_on_denial {
                    PipelineState::Closing
                } else {
                    PipelineState::AwaitingRequest
                });
                return proxy_auth_required(&self.ctx.realm, self.ctx.close_on_denial);
            }

            self.transition(PipelineState::Routing);
            let is_connect = req.method() == Method::CONNECT;
            let close_after = wants_close(&req);

            let result = if is_connect {
                self.handle_connect(req).await
            } else {
                self.handle_plain(req).await
            };

            match result {
                Ok(response) => {
                    metrics::record_request(if is_connect { "tunneled" } else { "relayed" }, start);
                    if !is_connect {
                        self.transition(if close_after {
                            PipelineState::Closing
                        } else {
                            PipelineState::AwaitingRequest
                        });
                    }
                    response
                }
                Err(err) => {
                    warn!(error = %err, kind = err.kind(), "Request failed");
                    metrics::record_relay_error(err.kind());
                    metrics::record_request("failed", start);
                    let mut response = error_response(&err);
                    if is_connect || close_after {
                        with_close(&mut response);
                        self.transition(PipelineState::Closing);
                    } else {
                        self.transition(PipelineState::AwaitingRequest);
                    }
                    response
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_plain(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let destination = match &self.intercepted {
            Some(destination) => destination.clone(),
            None => Destination::from_request(&req)?,
        };
        let tls = destination.scheme == Scheme::Https;

        self.transition(PipelineState::Relaying);
        debug!(destination = %destination, tls, "Relaying request");

        let mut leg = self.leg.lock().await;
        self.ctx.relay.relay(&mut leg, req, &destination, tls).await
    }

    async fn handle_connect(self: &Arc<Self>, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        if self.intercepted.is_some() {
            return Err(ProxyError::InvalidRequest(
                "CONNECT inside an intercepted tunnel".into(),
            ));
        }

        let destination = Destination::from_connect(&req)?;
        // Decided before dialing so a refused tunnel never reaches the origin.
        let mode = self.tunnel_mode(&destination).await?;
        let outbound = self.ctx.relay.open_tunnel(&destination).await?;

        self.transition(PipelineState::Tunneling);
        info!(destination = %destination, mode = mode.label(), "Tunnel established");

        let task = tokio::spawn(
            Arc::clone(self)
                .run_tunnel(req, outbound, destination, mode)
                .instrument(tracing::Span::current()),
        );
        self.guard.registry().attach_task(self.guard.id(), task.abort_handle());

        Ok(connect_established())
    }

    async fn tunnel_mode(&self, destination: &Destination) -> Result<TunnelMode, ProxyError> {
        let Some(authority) = &self.ctx.authority else {
            return Ok(TunnelMode::Opaque);
        };

        match authority.get_or_create_cert(destination.bare_host()).await {
            Ok(leaf) => Ok(TunnelMode::Intercept(leaf)),
            Err(e) => match self.ctx.certificate_failure {
                CertificateFailurePolicy::Tunnel => {
                    warn!(
                        destination = %destination,
                        error = %e,
                        "Certificate minting failed, relaying tunnel without interception"
                    );
                    Ok(TunnelMode::Opaque)
                }
                CertificateFailurePolicy::Reject => Err(e.into()),
            },
        }
    }

    // Boxed so the tunnel future's type does not depend on `serve`, which
    // it calls for intercepted traffic.
    fn run_tunnel(
        self: Arc<Self>,
        req: Request<Incoming>,
        mut outbound: TcpStream,
        destination: Destination,
        mode: TunnelMode,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(error = %e, "Client upgrade failed");
                    return;
                }
            };

            match mode {
                TunnelMode::Opaque => match relay_opaque(upgraded, &mut outbound).await {
                    Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "Tunnel closed"),
                    Err(e) => debug!(error = %e, "Tunnel ended with error"),
                },
                TunnelMode::Intercept(leaf) => {
                    self.intercept(upgraded, outbound, destination, leaf).await;
                }
            }
        })
    }

    async fn intercept(
        &self,
        upgraded: hyper::upgrade::Upgraded,
        outbound: TcpStream,
        destination: Destination,
        leaf: Arc<LeafCertificate>,
    ) {
        // A failed upstream handshake is reported per request as a 502 once
        // the client is talking to us.
        let leg = match self.ctx.relay.leg_over(outbound, &destination, true).await {
            Ok(leg) => Some(leg),
            Err(e) => {
                warn!(destination = %destination, error = %e, "Upstream TLS failed");
                None
            }
        };

        let client = match accept_intercepted(upgraded, &leaf).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Client TLS failed");
                return;
            }
        };

        let Some(close_rx) = self.guard.registry().close_signal(self.guard.id()) else {
            return;
        };

        debug!(destination = %destination, fingerprint = %leaf.fingerprint(), "Intercepting tunnel");
        self.intercepting(destination, leg).serve(client, close_rx).await;
    }
}

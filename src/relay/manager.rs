//! Outbound side of the proxy.
//!
//! # Responsibilities
//! - Decide where each outbound TCP connection goes (origin or chain proxy)
//! - Tell DNS failures, refused connects and timeouts apart
//! - Forward plain requests on a per-connection outbound leg
//! - Run matched response filters, streaming everything else untouched

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::destination::{Destination, Route};
use super::leg::OutboundLeg;
use crate::config::OverflowPolicy;
use crate::error::ProxyError;
use crate::filter::{
    buffer_response, Buffered, FilterRegistry, MatchedFilters, PrefixedBody, RequestFilter, RequestHead,
};
use crate::http::request::{absolute_uri, origin_form, strip_hop_by_hop};
use crate::http::response::{full_body, ProxyBody};
use crate::net::tls;
use crate::observability::metrics;

/// Upper bound on a chain proxy's CONNECT response head.
const MAX_CHAIN_RESPONSE_HEAD: usize = 8 * 1024;

pub struct RelayManager {
    route: Route,
    connect_timeout: Duration,
    filters: Arc<FilterRegistry>,
    overflow_policy: OverflowPolicy,
    tls: Option<TlsConnector>,
    request_filter: Option<Arc<dyn RequestFilter>>,
}

impl RelayManager {
    pub fn new(
        route: Route,
        connect_timeout: Duration,
        filters: Arc<FilterRegistry>,
        overflow_policy: OverflowPolicy,
        tls: Option<TlsConnector>,
    ) -> Self {
        Self {
            route,
            connect_timeout,
            filters,
            overflow_policy,
            tls,
            request_filter: None,
        }
    }

    /// Run `filter` on every relayed request head before it goes out.
    pub fn with_request_filter(mut self, filter: Option<Arc<dyn RequestFilter>>) -> Self {
        self.request_filter = filter;
        self
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Resolve and connect, bounded by the connect timeout.
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let addr = format!("{}:{}", host, port);
        let attempt = async {
            let candidates: Vec<_> = lookup_host((host, port))
                .await
                .map_err(|e| ProxyError::Resolution {
                    host: host.to_string(),
                    message: e.to_string(),
                })?
                .collect();

            if candidates.is_empty() {
                return Err(ProxyError::Resolution {
                    host: host.to_string(),
                    message: "no addresses".into(),
                });
            }

            let mut last_err = None;
            for candidate in candidates {
                match TcpStream::connect(candidate).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!(address = %candidate, error = %e, "Connect attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            Err::<TcpStream, ProxyError>(ProxyError::OutboundConnect {
                addr: addr.clone(),
                source: last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "no address connected")
                }),
            })
        };

        let stream = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| ProxyError::OutboundTimeout {
                addr: addr.clone(),
                timeout: self.connect_timeout,
            })??;

        let _ = stream.set_nodelay(true);
        debug!(address = %addr, "Outbound connection established");
        Ok(stream)
    }

    /// A raw byte stream to `dest`, for CONNECT tunnels. Through the chain
    /// proxy this performs the chain's own CONNECT handshake first.
    pub async fn open_tunnel(&self, dest: &Destination) -> Result<TcpStream, ProxyError> {
        match &self.route {
            Route::Direct => self.dial(dest.bare_host(), dest.port).await,
            Route::Chained { host, port } => {
                let mut stream = self.dial(host, *port).await?;
                let chain_addr = format!("{}:{}", host, port);
                tokio::time::timeout(
                    self.connect_timeout,
                    chain_connect(&mut stream, &chain_addr, dest),
                )
                .await
                .map_err(|_| ProxyError::OutboundTimeout {
                    addr: chain_addr.clone(),
                    timeout: self.connect_timeout,
                })??;
                Ok(stream)
            }
        }
    }

    /// Open a fresh leg for `dest`. TLS legs always reach the origin through
    /// a tunnel, so only plain chained legs speak absolute-form.
    pub async fn open_leg(&self, dest: &Destination, tls: bool) -> Result<OutboundLeg, ProxyError> {
        if tls {
            let stream = self.open_tunnel(dest).await?;
            return self.leg_over(stream, dest, true).await;
        }

        let stream = match &self.route {
            Route::Direct => self.dial(dest.bare_host(), dest.port).await?,
            Route::Chained { host, port } => self.dial(host, *port).await?,
        };
        self.leg_over(stream, dest, false).await
    }

    /// Build a leg on an already connected stream.
    pub async fn leg_over(
        &self,
        stream: TcpStream,
        dest: &Destination,
        tls: bool,
    ) -> Result<OutboundLeg, ProxyError> {
        let chained = self.route.is_chained();
        if !tls {
            return handshake(stream, dest, chained, false).await;
        }

        let connector = self
            .tls
            .as_ref()
            .ok_or_else(|| ProxyError::Tls("upstream TLS is not configured".into()))?;
        let server_name = tls::server_name(dest.bare_host())?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", dest, e)))?;
        handshake(stream, dest, chained, true).await
    }

    /// Forward one plain request and produce the response for the client.
    ///
    /// `slot` is the inbound connection's leg: reused when it still points at
    /// the same destination, replaced otherwise, cleared on failure.
    pub async fn relay(
        &self,
        slot: &mut Option<OutboundLeg>,
        request: Request<Incoming>,
        dest: &Destination,
        tls: bool,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let request = match &self.request_filter {
            Some(filter) => {
                let (mut parts, body) = request.into_parts();
                filter.filter_request(&mut parts);
                Request::from_parts(parts, body)
            }
            None => request,
        };

        let request_uri = if request.uri().authority().is_some() {
            request.uri().clone()
        } else {
            absolute_uri(dest.scheme.as_uri_scheme(), &dest.key(), request.uri())?
        };
        let head = RequestHead {
            method: request.method().clone(),
            uri: request_uri.clone(),
            headers: request.headers().clone(),
        };
        let request_uri_str = request_uri.to_string();

        let key = dest.key();
        let reuse = slot.as_ref().is_some_and(|leg| leg.reusable_for(&key, tls));
        if !reuse {
            *slot = Some(self.open_leg(dest, tls).await?);
        }
        let Some(leg) = slot.as_mut() else {
            return Err(ProxyError::OutboundIo {
                addr: key,
                message: "no outbound leg".into(),
            });
        };

        if leg.ready().await.is_err() {
            debug!(destination = %key, "Pooled leg went stale, reconnecting");
            *leg = self.open_leg(dest, tls).await?;
        }

        let outbound = prepare_outbound(request, dest, &request_uri, leg.uses_absolute_form());
        let response = match leg.send(outbound).await {
            Ok(response) => response,
            Err(e) => {
                *slot = None;
                return Err(classify_hyper_error(&key, e));
            }
        };

        let mut response = response;
        strip_hop_by_hop(response.headers_mut());

        match self.filters.matching(&key, &head, &request_uri_str) {
            None => Ok(response.map(|body| body.boxed())),
            Some(matched) => self.filter_response(matched, response, &key, &request_uri_str).await,
        }
    }

    async fn filter_response(
        &self,
        matched: MatchedFilters,
        response: Response<Incoming>,
        key: &str,
        request_uri: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let limit = matched.max_response_size();
        let buffered = buffer_response(response, limit)
            .await
            .map_err(|e| classify_hyper_error(key, e))?;

        match buffered {
            Buffered::Complete(response) => {
                metrics::record_filtered_response();
                debug!(destination = %key, filters = matched.len(), "Applying response filters");
                Ok(matched.apply(response, request_uri).map(|body: Bytes| full_body(body)))
            }
            Buffered::Overflow { parts, prefix, rest } => {
                metrics::record_filter_overflow();
                warn!(
                    destination = %key,
                    limit,
                    policy = ?self.overflow_policy,
                    "Response exceeded filter buffer"
                );
                match self.overflow_policy {
                    OverflowPolicy::Reject => Err(ProxyError::FilterOverflow { limit }),
                    OverflowPolicy::PassThrough => Ok(Response::from_parts(
                        parts,
                        PrefixedBody::new(prefix, rest).boxed(),
                    )),
                }
            }
        }
    }
}

async fn handshake<I>(io: I, dest: &Destination, chained: bool, tls: bool) -> Result<OutboundLeg, ProxyError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = dest.key();
    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| classify_hyper_error(&key, e))?;

    let target = key.clone();
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(destination = %target, error = %e, "Outbound connection ended with error");
        }
    });

    Ok(OutboundLeg::new(key, chained, tls, sender, driver))
}

/// Send `CONNECT dest` to the chain proxy and wait for a 2xx.
async fn chain_connect<S>(stream: &mut S, chain_addr: &str, dest: &Destination) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = dest.key();
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|e| ProxyError::OutboundIo {
            addr: chain_addr.to_string(),
            message: e.to_string(),
        })?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CHAIN_RESPONSE_HEAD {
            return Err(ProxyError::ChainRejected {
                addr: chain_addr.to_string(),
                status_line: "response head too large".into(),
            });
        }
        let n = stream.read(&mut byte).await.map_err(|e| ProxyError::OutboundIo {
            addr: chain_addr.to_string(),
            message: e.to_string(),
        })?;
        if n == 0 {
            return Err(ProxyError::OriginClosed {
                addr: chain_addr.to_string(),
            });
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();
    let accepted = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2') && code.len() == 3);

    if accepted {
        debug!(chain = %chain_addr, destination = %target, "Chain proxy tunnel established");
        Ok(())
    } else {
        Err(ProxyError::ChainRejected {
            addr: chain_addr.to_string(),
            status_line,
        })
    }
}

fn prepare_outbound(
    request: Request<Incoming>,
    dest: &Destination,
    request_uri: &Uri,
    absolute_form: bool,
) -> Request<ProxyBody> {
    let (mut parts, body) = request.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    if !parts.headers.contains_key(HOST) {
        let host = if dest.port == dest.scheme.default_port() {
            dest.host.clone()
        } else {
            dest.key()
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(HOST, value);
        }
    }

    parts.uri = if absolute_form {
        request_uri.clone()
    } else {
        origin_form(request_uri)
    };
    parts.version = Version::HTTP_11;

    Request::from_parts(parts, body.boxed())
}

fn classify_hyper_error(addr: &str, err: hyper::Error) -> ProxyError {
    if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        ProxyError::OriginClosed {
            addr: addr.to_string(),
        }
    } else {
        ProxyError::OutboundIo {
            addr: addr.to_string(),
            message: err.to_string(),
        }
    }
}

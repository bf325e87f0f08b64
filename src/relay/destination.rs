//! Destination resolution: where a request is going, and how we get there.

use hyper::header::HOST;
use hyper::http::uri::Authority;
use hyper::{Request, Uri};
use std::fmt;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_uri_scheme(self) -> hyper::http::uri::Scheme {
        match self {
            Scheme::Http => hyper::http::uri::Scheme::HTTP,
            Scheme::Https => hyper::http::uri::Scheme::HTTPS,
        }
    }
}

/// Target origin of a request or tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub scheme: Scheme,
    /// Host as written by the client; IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Destination of a CONNECT request (`host:port` authority form).
    pub fn from_connect<B>(request: &Request<B>) -> Result<Self, ProxyError> {
        let authority = request
            .uri()
            .authority()
            .ok_or_else(|| ProxyError::InvalidRequest("CONNECT target must be host:port".into()))?;
        Self::from_authority(authority, Scheme::Https)
    }

    /// Destination of a plain proxied request. Absolute-form targets are
    /// used as-is; origin-form targets fall back to the `Host` header.
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, ProxyError> {
        let uri = request.uri();
        if let Some(authority) = uri.authority() {
            let scheme = scheme_of(uri)?;
            return Self::from_authority(authority, scheme);
        }

        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ProxyError::InvalidRequest(format!("request target '{}' has no host", uri))
            })?;
        let authority: Authority = host
            .parse()
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid Host header '{}'", host)))?;
        Self::from_authority(&authority, Scheme::Http)
    }

    pub fn from_authority(authority: &Authority, scheme: Scheme) -> Result<Self, ProxyError> {
        let host = authority.host();
        if host.is_empty() {
            return Err(ProxyError::InvalidRequest(format!(
                "empty host in '{}'",
                authority
            )));
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port: authority.port_u16().unwrap_or_else(|| scheme.default_port()),
        })
    }

    /// Filter registry key: `host:port`, always with an explicit port.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, for name resolution and TLS.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn scheme_of(uri: &Uri) -> Result<Scheme, ProxyError> {
    match uri.scheme_str() {
        None | Some("http") => Ok(Scheme::Http),
        Some("https") => Ok(Scheme::Https),
        Some(other) => Err(ProxyError::InvalidRequest(format!(
            "unsupported scheme '{}'",
            other
        ))),
    }
}

/// Where the outbound TCP connection actually goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight to the destination.
    Direct,
    /// To the chain proxy at `host:port`; the destination travels in the
    /// request line or CONNECT target.
    Chained { host: String, port: u16 },
}

impl Route {
    pub fn for_chain(chain: Option<&str>) -> Result<Self, ProxyError> {
        let Some(chain) = chain else {
            return Ok(Route::Direct);
        };
        let (host, port) = split_host_port(chain)?;
        Ok(Route::Chained { host, port })
    }

    pub fn is_chained(&self) -> bool {
        matches!(self, Route::Chained { .. })
    }
}

/// Split `host:port`, requiring a numeric port. IPv6 hosts keep brackets off.
pub fn split_host_port(value: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Configuration(format!("'{}' is not host:port", value)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::Configuration(format!("invalid port in '{}'", value)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::Configuration(format!("empty host in '{}'", value)));
    }
    Ok((host.to_string(), port))
}

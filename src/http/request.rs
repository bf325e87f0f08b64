//! Request preparation for forwarding.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers before a request leaves the proxy
//! - Extract proxy credentials
//! - Convert between absolute-form and origin-form targets
//!
//! # Design Decisions
//! - Headers named in `Connection` are hop-by-hop too
//! - The original request head is snapshotted for filters before any change

use hyper::header::{HeaderMap, HeaderName, CONNECTION, PROXY_AUTHORIZATION};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, Uri};

use crate::error::ProxyError;

/// Headers that describe a single transport hop.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Raw `Proxy-Authorization` value, if present and valid UTF-8.
pub fn proxy_credentials<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Whether the client asked to close the connection after this exchange.
pub fn wants_close<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// The target as an origin server expects it: path and query only.
pub fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path)
}

/// Rebuild an origin-form target into an absolute URI for the given origin.
pub fn absolute_uri(scheme: Scheme, authority: &str, uri: &Uri) -> Result<Uri, ProxyError> {
    let authority: Authority = authority
        .parse()
        .map_err(|_| ProxyError::InvalidRequest(format!("invalid authority '{}'", authority)))?;
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn strips_fixed_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert("x-keep", HeaderValue::from_static("yes"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-keep"], "yes");
    }

    #[test]
    fn origin_form_keeps_path_and_query() {
        let uri: Uri = "http://example.com:8080/a/b?c=d".parse().unwrap();
        assert_eq!(origin_form(&uri).to_string(), "/a/b?c=d");

        let bare: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&bare).to_string(), "/");
    }

    #[test]
    fn absolute_uri_from_origin_form() {
        let uri: Uri = "/api/v1?x=1".parse().unwrap();
        let abs = absolute_uri(Scheme::HTTPS, "example.com:443", &uri).unwrap();
        assert_eq!(abs.to_string(), "https://example.com:443/api/v1?x=1");
    }

    #[test]
    fn connection_close_detected_case_insensitively() {
        let req = Request::get("http://a/")
            .header(CONNECTION, "Keep-Alive, Close")
            .body(())
            .unwrap();
        assert!(wants_close(&req));

        let req = Request::get("http://a/").body(()).unwrap();
        assert!(!wants_close(&req));
    }
}

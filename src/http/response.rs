//! Responses the proxy itself produces.
//!
//! Every relay failure becomes a distinct response carrying an
//! `X-Proxy-Error` tag, so a client never waits on a silent hang.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

use crate::error::ProxyError;

/// Body type of everything the proxy writes to a client.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const X_PROXY_ERROR: &str = "x-proxy-error";

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Status code for a relay failure.
pub fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::OutboundTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::AuthorizationDenied => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        ProxyError::Resolution { .. }
        | ProxyError::OutboundConnect { .. }
        | ProxyError::OutboundIo { .. }
        | ProxyError::OriginClosed { .. }
        | ProxyError::ChainRejected { .. }
        | ProxyError::FilterOverflow { .. }
        | ProxyError::Certificate(_)
        | ProxyError::Tls(_)
        | ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Failure response for a relay error, tagged with the error kind.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut response = text_response(status_for(err), format!("{}\n", err));
    response
        .headers_mut()
        .insert(X_PROXY_ERROR, HeaderValue::from_static(err.kind()));
    response
}

/// The 407 challenge for a denied request.
pub fn proxy_auth_required(realm: &str, close: bool) -> Response<ProxyBody> {
    let mut response = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy authentication required\n".to_string(),
    );
    let challenge = format!("Basic realm=\"{}\"", realm.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(PROXY_AUTHENTICATE, value);
    }
    if close {
        with_close(&mut response);
    }
    response
}

/// Reply to a CONNECT once the outbound side is ready.
pub fn connect_established() -> Response<ProxyBody> {
    Response::new(empty_body())
}

pub fn with_close<B>(response: &mut Response<B>) {
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
}

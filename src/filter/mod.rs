//! Response filtering subsystem.
//!
//! # Data Flow
//! ```text
//! Request head (method, target, headers)
//!     → registry.rs (lookup by destination host:port)
//!     → matcher.rs (optional path predicate per entry)
//!     → HttpFilter::should_filter_responses
//!     → MatchedFilters (ordered, insertion order)
//!
//! Origin response
//!     → body.rs (buffer up to the smallest max_response_size)
//!     → each filter in order, output of one feeding the next
//!     → client
//! ```
//!
//! # Design Decisions
//! - Destination keys are exact, case-sensitive `host:port` strings
//! - Unmatched responses are streamed, never buffered
//! - Exceeding a buffer limit is an explicit error, never silent truncation

pub mod body;
pub mod matcher;
pub mod registry;

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, Uri};

pub use body::{buffer_response, Buffered, PrefixedBody};
pub use matcher::{request_path, BasePathMatcher};
pub use registry::{FilterEntry, FilterRegistry, MatchedFilters};

/// The parts of a request a filter gets to look at.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
        }
    }
}

/// Response filter capability.
///
/// When `should_filter_responses` is false the response streams through
/// untouched. When true, the body is buffered up to `max_response_size`
/// bytes and handed to `filter_response`, which may rewrite body and headers.
pub trait HttpFilter: Send + Sync {
    fn should_filter_responses(&self, request: &RequestHead) -> bool;

    fn filter_response(&self, response: Response<Bytes>, request_uri: &str) -> Response<Bytes>;

    fn max_response_size(&self) -> usize;
}

/// A filter that never asks to see responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpFilter;

impl HttpFilter for NoOpFilter {
    fn should_filter_responses(&self, _request: &RequestHead) -> bool {
        false
    }

    fn filter_response(&self, response: Response<Bytes>, _request_uri: &str) -> Response<Bytes> {
        response
    }

    fn max_response_size(&self) -> usize {
        // never consulted, should_filter_responses is always false
        0
    }
}

/// Closure-backed [`HttpFilter`] that filters every response it is matched to.
pub struct FnFilter<F> {
    f: F,
    max_response_size: usize,
}

impl<F> FnFilter<F>
where
    F: Fn(Response<Bytes>, &str) -> Response<Bytes> + Send + Sync,
{
    pub fn new(max_response_size: usize, f: F) -> Self {
        Self { f, max_response_size }
    }
}

impl<F> HttpFilter for FnFilter<F>
where
    F: Fn(Response<Bytes>, &str) -> Response<Bytes> + Send + Sync,
{
    fn should_filter_responses(&self, _request: &RequestHead) -> bool {
        true
    }

    fn filter_response(&self, response: Response<Bytes>, request_uri: &str) -> Response<Bytes> {
        (self.f)(response, request_uri)
    }

    fn max_response_size(&self) -> usize {
        self.max_response_size
    }
}

/// Request-side hook, run on every relayed request before it goes out.
///
/// Sees the head only; the body streams through untouched.
pub trait RequestFilter: Send + Sync {
    fn filter_request(&self, parts: &mut Parts);
}

/// Closure-backed [`RequestFilter`].
pub struct FnRequestFilter<F> {
    f: F,
}

impl<F> FnRequestFilter<F>
where
    F: Fn(&mut Parts) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> RequestFilter for FnRequestFilter<F>
where
    F: Fn(&mut Parts) + Send + Sync,
{
    fn filter_request(&self, parts: &mut Parts) {
        (self.f)(parts)
    }
}

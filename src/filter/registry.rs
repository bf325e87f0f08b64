//! Destination-keyed filter registry.
//!
//! Built before the server starts, then frozen behind an `Arc` and shared by
//! every connection without locking.

use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Method, Response, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::matcher::BasePathMatcher;
use super::{HttpFilter, RequestHead};
use crate::error::ProxyError;

/// One registered filter with its optional path predicate.
#[derive(Clone)]
pub struct FilterEntry {
    filter: Arc<dyn HttpFilter>,
    path: Option<BasePathMatcher>,
}

impl FilterEntry {
    pub fn new(filter: Arc<dyn HttpFilter>, path: Option<BasePathMatcher>) -> Self {
        Self { filter, path }
    }

    pub fn filter(&self) -> &Arc<dyn HttpFilter> {
        &self.filter
    }

    pub fn path(&self) -> Option<&BasePathMatcher> {
        self.path.as_ref()
    }

    /// Path predicate (if any) passes and the filter wants the response.
    pub fn applies_to(&self, request: &RequestHead, request_uri: &str) -> bool {
        let path_ok = self.path.as_ref().map_or(true, |m| m.matches(request_uri));
        path_ok && self.filter.should_filter_responses(request)
    }

    fn same_filter(&self, other: &Arc<dyn HttpFilter>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.filter) as *const (),
            Arc::as_ptr(other) as *const (),
        )
    }
}

impl fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEntry")
            .field("path", &self.path.as_ref().map(|m| m.pattern()))
            .finish()
    }
}

/// Maps `host:port` to an ordered list of filters.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    entries: HashMap<String, Vec<FilterEntry>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter for a destination. A filter already registered for
    /// the same key is ignored; returns whether it was added.
    pub fn add(&mut self, host_and_port: &str, filter: Arc<dyn HttpFilter>) -> bool {
        self.insert(host_and_port, FilterEntry::new(filter, None))
    }

    /// Register a filter gated by a path pattern.
    pub fn add_for_path(
        &mut self,
        host_and_port: &str,
        path_pattern: &str,
        filter: Arc<dyn HttpFilter>,
    ) -> Result<bool, ProxyError> {
        let matcher = BasePathMatcher::new(path_pattern)?;
        Ok(self.insert(host_and_port, FilterEntry::new(filter, Some(matcher))))
    }

    fn insert(&mut self, host_and_port: &str, entry: FilterEntry) -> bool {
        let list = self.entries.entry(host_and_port.to_string()).or_default();
        if list.iter().any(|e| e.same_filter(&entry.filter)) {
            return false;
        }
        list.push(entry);
        true
    }

    /// Filters registered for a destination, in insertion order. Empty when absent.
    pub fn lookup(&self, host_and_port: &str) -> &[FilterEntry] {
        self.entries
            .get(host_and_port)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Filters that apply to this request, or `None` if the response should
    /// stream through untouched.
    pub fn matching(
        &self,
        host_and_port: &str,
        request: &RequestHead,
        request_uri: &str,
    ) -> Option<MatchedFilters> {
        let filters: Vec<Arc<dyn HttpFilter>> = self
            .lookup(host_and_port)
            .iter()
            .filter(|e| e.applies_to(request, request_uri))
            .map(|e| Arc::clone(e.filter()))
            .collect();

        if filters.is_empty() {
            None
        } else {
            Some(MatchedFilters {
                filters,
                head_request: request.method == Method::HEAD,
            })
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The filters selected for one response.
pub struct MatchedFilters {
    filters: Vec<Arc<dyn HttpFilter>>,
    head_request: bool,
}

impl MatchedFilters {
    /// Buffer limit honoured by every matched filter.
    pub fn max_response_size(&self) -> usize {
        self.filters
            .iter()
            .map(|f| f.max_response_size())
            .min()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the filters in order and fix up framing headers for the result.
    ///
    /// Responses that carry no body on the wire (HEAD, 1xx, 204, 304) keep
    /// the origin's framing headers.
    pub fn apply(&self, response: Response<Bytes>, request_uri: &str) -> Response<Bytes> {
        let mut response = self
            .filters
            .iter()
            .fold(response, |resp, f| f.filter_response(resp, request_uri));

        if self.head_request || is_bodiless(response.status()) {
            return response;
        }

        let len = response.body().len();
        let headers = response.headers_mut();
        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        response
    }
}

fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

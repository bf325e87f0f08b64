//! Request path matching for response filters.
//!
//! # Responsibilities
//! - Extract the path component of a request target
//! - Match it against a prefix-anchored regular expression
//!
//! # Design Decisions
//! - "Looking at" semantics: the pattern must match a prefix of the path,
//!   not the whole path. `^/api` matches `/api/v1/x`.
//! - The path is everything from the first `/` after the authority,
//!   query string included. Origin-form targets are used as-is.
//! - Targets without a path (`http://host`, authority-form, `*`) never match.

use regex::Regex;
use std::fmt;

use crate::error::ProxyError;

/// Matches the path component of a request target against a pattern.
#[derive(Debug, Clone)]
pub struct BasePathMatcher {
    pattern: String,
    anchored: Regex,
}

impl BasePathMatcher {
    /// Compile a pattern. Malformed patterns are a configuration error.
    pub fn new(pattern: &str) -> Result<Self, ProxyError> {
        let anchored = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
            ProxyError::Configuration(format!("invalid path pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            anchored,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True if a prefix of the target's path matches the pattern.
    pub fn matches(&self, request_target: &str) -> bool {
        match request_path(request_target) {
            Some(path) => {
                let result = self.anchored.is_match(path);
                tracing::debug!(path, pattern = %self.pattern, result, "Path match");
                result
            }
            None => false,
        }
    }
}

impl fmt::Display for BasePathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request Matcher for: {}", self.pattern)
    }
}

/// Extract the path (and query) of a request target.
///
/// ```text
/// http://host:8080/a/b?c   → /a/b?c
/// /a/b                     → /a/b
/// http://host              → None
/// host:443                 → None
/// ```
pub fn request_path(target: &str) -> Option<&str> {
    if target.starts_with('/') {
        return Some(target);
    }
    let (scheme, rest) = target.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
        return None;
    }
    let slash = rest.find('/')?;
    if slash == 0 {
        // empty authority
        return None;
    }
    Some(&rest[slash..])
}

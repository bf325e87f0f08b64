//! Proxy authorization.
//!
//! # Responsibilities
//! - Hold an ordered chain of credential validators
//! - Decide whether a request's `Proxy-Authorization` value is acceptable
//!
//! # Design Decisions
//! - OR semantics: any validator accepting the credentials authorizes
//! - Empty chain means no authentication is required
//! - Validators may be appended while the server is running; reads are
//!   lock-free (copy-on-write list behind `ArcSwap`)

pub mod basic;

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

pub use basic::BasicAuthValidator;

/// Capability deciding whether inbound credentials are acceptable.
///
/// `credentials` is the raw `Proxy-Authorization` header value, or `None`
/// when the client sent none.
pub trait AuthValidator: Send + Sync {
    fn validate(&self, credentials: Option<&str>) -> bool;
}

/// Closure-backed [`AuthValidator`].
pub struct FnValidator<F>(F);

impl<F> FnValidator<F>
where
    F: Fn(Option<&str>) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> AuthValidator for FnValidator<F>
where
    F: Fn(Option<&str>) -> bool + Send + Sync,
{
    fn validate(&self, credentials: Option<&str>) -> bool {
        (self.0)(credentials)
    }
}

/// Ordered chain of validators evaluated before any outbound leg opens.
pub struct AuthorizationGate {
    handlers: ArcSwap<Vec<Arc<dyn AuthValidator>>>,
}

impl AuthorizationGate {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Append a validator. Safe to call concurrently with `is_authorized`.
    pub fn add_handler(&self, validator: Arc<dyn AuthValidator>) {
        self.handlers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&validator));
            next
        });
    }

    /// True if no validators are registered or any of them accepts.
    pub fn is_authorized(&self, credentials: Option<&str>) -> bool {
        let handlers = self.handlers.load();
        handlers.is_empty() || handlers.iter().any(|v| v.validate(credentials))
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.load().is_empty()
    }
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGate")
            .field("handlers", &self.len())
            .finish()
    }
}

//! Forward HTTP/HTTPS proxy library.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client                                                    Origin / Chain proxy
//!       │                                                              ▲
//!       ▼                                                              │
//!  ┌─────────┐   ┌───────────────────┐   ┌──────────────┐   ┌──────────────────┐
//!  │   net   │──▶│  http::pipeline   │──▶│    relay     │──▶│  outbound leg /  │
//!  │listener │   │ (state machine)   │   │   manager    │   │     tunnel       │
//!  └─────────┘   └───────┬───────────┘   └──────┬───────┘   └──────────────────┘
//!                        │                      │
//!                  ┌─────▼─────┐         ┌──────▼──────┐      ┌──────────┐
//!                  │   auth    │         │   filter    │      │   cert   │
//!                  │   gate    │         │  registry   │      │ authority│
//!                  └───────────┘         └─────────────┘      └──────────┘
//!
//!   Cross-cutting: config, lifecycle, observability, error
//! ```

pub mod auth;
pub mod cert;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod relay;

pub use auth::{AuthValidator, AuthorizationGate, BasicAuthValidator, FnValidator};
pub use cert::{CertificateAuthority, LeafCertificate};
pub use config::{BindMode, ProxyConfig};
pub use error::{ProxyError, ProxyResult};
pub use filter::{FnFilter, FnRequestFilter, HttpFilter, NoOpFilter, RequestFilter, RequestHead};
pub use http::ProxyServer;

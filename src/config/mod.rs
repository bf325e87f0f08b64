//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → snapshot taken by ProxyServer::start()
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → new auth.users appended to the AuthorizationGate
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the server starts; only credentials widen live
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AuthConfig, BindMode, CertificateFailurePolicy, ChainConfig, FilterConfig, ListenerConfig,
    MitmConfig, ObservabilityConfig, OverflowPolicy, ProxyConfig, RuntimeConfig, TimeoutConfig,
    UserCredentials,
};

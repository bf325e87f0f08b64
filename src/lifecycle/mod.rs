//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     stop() → accept loop stops → connections drain → stragglers aborted
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ProxyServer::stop(), once
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, force-close
//! - Shutdown has a deadline: the configured grace period

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;

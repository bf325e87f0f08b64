//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind mode, accept loop, connection limits)
//!     → connection.rs (registry entry, close signal)
//!     → Hand off to HTTP layer
//!
//! CONNECT with interception:
//!     → tls.rs (acceptor from a minted leaf, upstream connector)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Outbound TLS trusts the system roots

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{CloseSignal, ConnectionGuard, ConnectionId, ConnectionRegistry};
pub use listener::{ConnectionPermit, Listener};

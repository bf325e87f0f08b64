//! Relay subsystem: everything on the outbound side of a connection.
//!
//! # Data Flow
//! ```text
//! Plain request:
//!     destination.rs (target → Destination, chain → Route)
//!     → manager.rs (reuse or open leg, forward, filter response)
//!     → leg.rs (HTTP/1.1 client connection, aborted on drop)
//!
//! CONNECT:
//!     manager.rs (direct TCP, or chain proxy + CONNECT handshake)
//!     → 200 to client
//!     → tunnel.rs (opaque copy, or TLS termination for interception)
//! ```
//!
//! # Design Decisions
//! - With a chain proxy configured, no connection ever goes to the literal
//!   destination
//! - DNS resolution is done before connecting so its failure is reported
//!   on its own

pub mod destination;
pub mod leg;
pub mod manager;
pub mod tunnel;

pub use destination::{Destination, Route, Scheme};
pub use leg::OutboundLeg;
pub use manager::RelayManager;
pub use tunnel::TunnelMode;

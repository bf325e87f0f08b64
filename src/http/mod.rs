//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → server.rs (accept loop, registry, shutdown)
//!     → pipeline.rs (per-connection state machine, auth gate)
//!     → request.rs (hop-by-hop stripping, target forms)
//!     → relay subsystem
//!     → response.rs (proxy-generated and failure responses)
//!     → client
//! ```

pub mod pipeline;
pub mod request;
pub mod response;
pub mod server;

pub use pipeline::{InboundPipeline, PipelineState};
pub use response::ProxyBody;
pub use server::ProxyServer;

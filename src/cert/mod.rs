//! Certificate authority for TLS interception.
//!
//! # Responsibilities
//! - Own the signing root (generated, or loaded from PEM files)
//! - Mint one leaf certificate per host, on first use
//! - Cache minted leaves so a host's certificate is stable for the process
//!
//! # Design Decisions
//! - The cache is a `DashMap` entry per host; concurrent first requests for
//!   the same host serialize on the entry, so only one leaf is minted
//! - Leaves are never evicted

mod authority;

pub use authority::{CertificateAuthority, LeafCertificate};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Invalid host for certificate: '{0}'")]
    InvalidHost(String),

    #[error("Failed to parse CA material: {0}")]
    Parse(String),

    #[error("CA certificate and key must both exist or both be absent")]
    IncompleteAuthority,

    #[error("TLS configuration for minted certificate failed: {0}")]
    Tls(String),

    #[error("CA file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

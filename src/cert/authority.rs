use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::CertificateError;
use crate::net::tls;
use crate::observability::metrics;

/// A minted leaf certificate and the TLS server config that presents it.
pub struct LeafCertificate {
    host: String,
    cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Lowercase hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.cert_der.as_ref())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Signing root plus the per-host leaf cache.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    leaves: DashMap<String, Arc<OnceCell<Arc<LeafCertificate>>>>,
    minted: AtomicU64,
}

impl CertificateAuthority {
    /// Fresh in-memory root.
    pub fn generate_self_signed(common_name: &str) -> Result<Self, CertificateError> {
        let (authority, _key_pem) = Self::generate(common_name)?;
        Ok(authority)
    }

    /// Load the root from PEM files, or generate one and write it there when
    /// neither file exists.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        common_name: &str,
    ) -> Result<Self, CertificateError> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read_to_string(cert_path)?;
                let key_pem = fs::read_to_string(key_path)?;
                info!(path = %cert_path.display(), "Loaded CA certificate");
                Self::from_pem(&cert_pem, &key_pem)
            }
            (false, false) => {
                let (authority, key_pem) = Self::generate(common_name)?;
                for path in [cert_path, key_path] {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::write(cert_path, &authority.ca_cert_pem)?;
                fs::write(key_path, key_pem)?;
                info!(path = %cert_path.display(), "Generated new CA certificate");
                Ok(authority)
            }
            _ => Err(CertificateError::IncompleteAuthority),
        }
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| CertificateError::Parse(e.to_string()))?;

        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::Parse("no certificate in PEM".into()))?
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        Ok(Self::with_issuer(issuer, ca_cert_der, cert_pem.to_string()))
    }

    fn generate(common_name: &str) -> Result<(Self, String), CertificateError> {
        let key = KeyPair::generate()?;
        let key_pem = key.serialize_pem();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let cert = params.self_signed(&key)?;
        let ca_cert_der = cert.der().clone();
        let ca_cert_pem = cert.pem();
        let issuer = Issuer::new(params, key);

        Ok((Self::with_issuer(issuer, ca_cert_der, ca_cert_pem), key_pem))
    }

    fn with_issuer(
        issuer: Issuer<'static, KeyPair>,
        ca_cert_der: CertificateDer<'static>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            issuer,
            ca_cert_der,
            ca_cert_pem,
            leaves: DashMap::new(),
            minted: AtomicU64::new(0),
        }
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Leaf certificate for `host`, minting it on first use.
    ///
    /// Host names are case-insensitive. Concurrent first calls for one host
    /// produce a single certificate; the map shard is only locked to fetch
    /// the host's slot, never while minting.
    pub async fn get_or_create_cert(&self, host: &str) -> Result<Arc<LeafCertificate>, CertificateError> {
        let host = normalize_host(host)?;

        if let Some(leaf) = self.leaves.get(&host).and_then(|slot| slot.value().get().cloned()) {
            return Ok(leaf);
        }

        let slot = Arc::clone(self.leaves.entry(host.clone()).or_default().value());
        match slot
            .get_or_try_init(|| async { self.mint(&host).map(Arc::new) })
            .await
        {
            Ok(leaf) => Ok(Arc::clone(leaf)),
            Err(e) => {
                self.leaves.remove_if(&host, |_, slot| !slot.initialized());
                Err(e)
            }
        }
    }

    /// Number of leaves minted since construction.
    pub fn minted_count(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    pub fn cached_count(&self) -> usize {
        self.leaves.iter().filter(|slot| slot.initialized()).count()
    }

    fn mint(&self, host: &str) -> Result<LeafCertificate, CertificateError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CertificateError::InvalidHost(host.to_string()))?,
            ),
        };
        params.subject_alt_names.push(san);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer)?;
        let cert_der = cert.der().clone();

        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let chain = vec![cert_der.clone(), self.ca_cert_der.clone()];
        let server_config = tls::server_config(chain, private_key)
            .map_err(|e| CertificateError::Tls(e.to_string()))?;

        self.minted.fetch_add(1, Ordering::Relaxed);
        metrics::record_certificate_minted();
        debug!(host = %host, "Minted leaf certificate");

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_der,
            server_config: Arc::new(server_config),
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cached_count())
            .field("minted", &self.minted_count())
            .finish()
    }
}

fn normalize_host(host: &str) -> Result<String, CertificateError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || ServerName::try_from(host).is_err() {
        return Err(CertificateError::InvalidHost(host.to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

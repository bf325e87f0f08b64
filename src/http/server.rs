//! The proxy server: configuration surface, accept loop, and shutdown.
//!
//! # Responsibilities
//! - Collect filters, validators and upstream trust roots before start
//! - Bind the listener and dispatch each accepted connection to its own task
//! - Keep every connection in the registry for bulk shutdown
//! - Stop gracefully within the grace period, then force-close
//!
//! # Design Decisions
//! - The filter registry freezes at `start()`; later additions are rejected
//! - Validators may be added at any time
//! - `start()` is single-shot; `stop()` is idempotent

use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::pipeline::{InboundPipeline, PipelineContext};
use crate::auth::{AuthValidator, AuthorizationGate, BasicAuthValidator};
use crate::cert::CertificateAuthority;
use crate::config::loader::ConfigError;
use crate::config::validation::validate_config;
use crate::config::{BindMode, MitmConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::filter::{FilterRegistry, HttpFilter, RequestFilter};
use crate::lifecycle::Shutdown;
use crate::net::{tls, CloseSignal, ConnectionPermit, ConnectionRegistry, Listener};
use crate::relay::{RelayManager, Route};

/// Settings that may only change before `start()`.
#[derive(Default)]
struct Setup {
    filters: FilterRegistry,
    request_filter: Option<Arc<dyn RequestFilter>>,
    upstream_roots: Vec<CertificateDer<'static>>,
    started: bool,
}

struct Running {
    shutdown: Shutdown,
    accept_task: JoinHandle<()>,
}

pub struct ProxyServer {
    config: ProxyConfig,
    gate: Arc<AuthorizationGate>,
    authority: Option<Arc<CertificateAuthority>>,
    registry: Arc<ConnectionRegistry>,
    setup: Mutex<Setup>,
    running: tokio::sync::Mutex<Option<Running>>,
    local_addr: OnceLock<SocketAddr>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("local_addr", &self.local_addr.get())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Build a server from configuration. The configuration is validated
    /// first. Users listed under `auth.users` are registered as Basic
    /// validators; with `mitm.enabled` the CA is loaded or generated here.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let gate = Arc::new(AuthorizationGate::new());
        for user in &config.auth.users {
            gate.add_handler(Arc::new(BasicAuthValidator::new(
                user.username.clone(),
                user.password.clone(),
            )));
        }

        let authority = if config.mitm.enabled {
            Some(Arc::new(build_authority(&config.mitm)?))
        } else {
            None
        };

        Ok(Self {
            config,
            gate,
            authority,
            registry: ConnectionRegistry::new(),
            setup: Mutex::new(Setup::default()),
            running: tokio::sync::Mutex::new(None),
            local_addr: OnceLock::new(),
        })
    }

    /// Build a server seeded with filters. The map is copied.
    pub fn with_filters(
        config: ProxyConfig,
        filters: &HashMap<String, Vec<Arc<dyn HttpFilter>>>,
    ) -> Result<Self, ProxyError> {
        let server = Self::new(config)?;
        for (key, list) in filters {
            for filter in list {
                server.add_filter(key, Arc::clone(filter))?;
            }
        }
        Ok(server)
    }

    /// Use an explicit CA for interception, replacing any configured one.
    pub fn with_certificate_authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    fn setup(&self) -> Result<std::sync::MutexGuard<'_, Setup>, ProxyError> {
        let setup = self
            .setup
            .lock()
            .map_err(|_| ProxyError::Configuration("server setup lock poisoned".into()))?;
        if setup.started {
            return Err(ProxyError::Configuration(
                "cannot change server setup after start()".into(),
            ));
        }
        Ok(setup)
    }

    /// Register a response filter for `host:port`.
    pub fn add_filter(&self, host_and_port: &str, filter: Arc<dyn HttpFilter>) -> Result<(), ProxyError> {
        let mut setup = self.setup()?;
        if !setup.filters.add(host_and_port, filter) {
            debug!(destination = %host_and_port, "Filter already registered, ignoring");
        }
        Ok(())
    }

    /// Register a response filter for `host:port`, limited to request paths
    /// whose prefix matches `path_pattern`.
    pub fn add_filter_for_path(
        &self,
        host_and_port: &str,
        path_pattern: &str,
        filter: Arc<dyn HttpFilter>,
    ) -> Result<(), ProxyError> {
        let mut setup = self.setup()?;
        if !setup.filters.add_for_path(host_and_port, path_pattern, filter)? {
            debug!(destination = %host_and_port, "Filter already registered, ignoring");
        }
        Ok(())
    }

    /// Set the request filter run on every relayed request, replacing any
    /// earlier one.
    pub fn set_request_filter(&self, filter: Arc<dyn RequestFilter>) -> Result<(), ProxyError> {
        self.setup()?.request_filter = Some(filter);
        Ok(())
    }

    /// Trust an extra root for upstream TLS, in addition to the system roots.
    pub fn add_upstream_root(&self, root: CertificateDer<'static>) -> Result<(), ProxyError> {
        self.setup()?.upstream_roots.push(root);
        Ok(())
    }

    /// Append a credential validator. Allowed while running.
    pub fn add_auth_validator(&self, validator: Arc<dyn AuthValidator>) {
        self.gate.add_handler(validator);
    }

    pub fn authorization_gate(&self) -> Arc<AuthorizationGate> {
        Arc::clone(&self.gate)
    }

    /// The interception CA, if interception is enabled.
    pub fn certificate_authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.authority.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self, bind_mode: BindMode) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() || self.local_addr.get().is_some() {
            return Err(ProxyError::Configuration("server already started".into()));
        }

        let route = Route::for_chain(self.config.chain.proxy.as_deref())?;
        let listener = Listener::bind(bind_mode, &self.config.listener).await?;
        let local_addr = listener.local_addr()?;

        let (filters, request_filter, roots) = {
            let mut setup = self.setup()?;
            setup.started = true;
            (
                std::mem::take(&mut setup.filters),
                setup.request_filter.take(),
                std::mem::take(&mut setup.upstream_roots),
            )
        };
        info!(filters = filters.len(), validators = self.gate.len(), "Server setup frozen");

        let relay = RelayManager::new(
            route,
            self.config.timeouts.connect(),
            Arc::new(filters),
            self.config.filters.overflow_policy,
            Some(tls::upstream_connector(&roots)?),
        )
        .with_request_filter(request_filter);

        let ctx = Arc::new(PipelineContext {
            gate: Arc::clone(&self.gate),
            relay: Arc::new(relay),
            authority: self.authority.clone(),
            realm: self.config.auth.realm.clone(),
            close_on_denial: self.config.auth.close_on_denial,
            certificate_failure: self.config.mitm.on_certificate_failure,
        });

        let shutdown = Shutdown::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            Arc::clone(&self.registry),
            shutdown.subscribe(),
        ));

        let _ = self.local_addr.set(local_addr);
        *running = Some(Running {
            shutdown,
            accept_task,
        });

        info!(
            address = %local_addr,
            chain_proxy = ?self.config.chain.proxy,
            interception = self.authority.is_some(),
            "Proxy server started"
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every connection gracefully, and force-close
    /// whatever is left when the grace period runs out. Safe to call more
    /// than once and before `start()`.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Server not running, nothing to stop");
            return;
        };

        info!(connections = self.registry.len(), "Stopping proxy server");
        running.shutdown.trigger();
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        self.registry.signal_all(CloseSignal::Graceful);
        let grace = self.config.timeouts.shutdown_grace();
        if !self.registry.wait_until_empty(grace).await {
            let err = ProxyError::ShutdownTimeout(grace);
            warn!(error = %err, remaining = self.registry.len(), "Force-closing remaining connections");
            self.registry.signal_all(CloseSignal::Force);
            self.registry.abort_all();
            if !self.registry.wait_until_empty(Duration::from_secs(1)).await {
                warn!(remaining = self.registry.len(), "Connections still registered after abort");
            }
        }

        info!("Proxy server stopped");
    }
}

fn build_authority(mitm: &MitmConfig) -> Result<CertificateAuthority, ProxyError> {
    let authority = match (&mitm.ca_cert_path, &mitm.ca_key_path) {
        (Some(cert), Some(key)) => {
            CertificateAuthority::load_or_generate(Path::new(cert), Path::new(key), &mitm.ca_common_name)?
        }
        (None, None) => CertificateAuthority::generate_self_signed(&mitm.ca_common_name)?,
        _ => {
            return Err(ProxyError::Configuration(
                "mitm.ca_cert_path and mitm.ca_key_path must be set together".into(),
            ))
        }
    };
    Ok(authority)
}

async fn accept_loop(
    listener: Listener,
    ctx: Arc<PipelineContext>,
    registry: Arc<ConnectionRegistry>,
    mut stop: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr, permit)) => {
                    spawn_connection(&ctx, &registry, stream, peer_addr, permit);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    info!("Stopped accepting connections");
}

fn spawn_connection(
    ctx: &Arc<PipelineContext>,
    registry: &Arc<ConnectionRegistry>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: ConnectionPermit,
) {
    let (guard, close_rx) = registry.register(peer_addr);
    let id = guard.id();
    let pipeline = InboundPipeline::new(Arc::clone(ctx), guard, peer_addr);
    let span = tracing::info_span!("connection", connection_id = %id, peer_addr = %peer_addr);

    let task = tokio::spawn(
        async move {
            let _permit = permit;
            let _ = stream.set_nodelay(true);
            debug!("Connection opened");
            pipeline.serve(stream, close_rx).await;
            debug!("Connection closed");
        }
        .instrument(span),
    );
    registry.attach_task(id, task.abort_handle());
}

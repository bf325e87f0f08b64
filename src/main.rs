//! Forward proxy launcher.

use clap::Parser;
use std::path::PathBuf;

use forward_proxy::config::loader::load_config;
use forward_proxy::config::validation::validate_config;
use forward_proxy::config::watcher::ConfigWatcher;
use forward_proxy::lifecycle::signals;
use forward_proxy::observability::{logging, metrics};
use forward_proxy::{BindMode, ProxyConfig, ProxyServer};

const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", version, about = "Forward HTTP/HTTPS proxy")]
struct Cli {
    /// Listening port. Malformed values fall back to 8080.
    port: Option<String>,

    /// TOML configuration file (watched for credential changes).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// loopback-only | any-address | resolved-local-host
    #[arg(long)]
    bind_mode: Option<BindMode>,

    /// Send all outbound traffic through this proxy (host:port).
    #[arg(long)]
    chain_proxy: Option<String>,

    /// Intercept CONNECT tunnels with minted certificates.
    #[arg(long)]
    mitm: bool,

    #[arg(long, requires = "ca_key")]
    ca_cert: Option<String>,

    #[arg(long, requires = "ca_cert")]
    ca_key: Option<String>,
}

fn parse_port(raw: &str) -> u16 {
    match raw.trim().parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            tracing::warn!(value = %raw, default = DEFAULT_PORT, "Invalid port, using default");
            DEFAULT_PORT
        }
    }
}

fn apply_overrides(cli: &Cli, config: &mut ProxyConfig) {
    if let Some(raw) = &cli.port {
        config.listener.port = parse_port(raw);
    }
    if let Some(mode) = cli.bind_mode {
        config.listener.bind_mode = mode;
    }
    if let Some(chain) = &cli.chain_proxy {
        config.chain.proxy = Some(chain.clone());
    }
    if cli.mitm {
        config.mitm.enabled = true;
    }
    if cli.ca_cert.is_some() {
        config.mitm.ca_cert_path = cli.ca_cert.clone();
        config.mitm.ca_key_path = cli.ca_key.clone();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&file_config.observability.log_level)?;
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = file_config.clone();
    apply_overrides(&cli, &mut config);
    if let Err(errors) = validate_config(&config) {
        for e in &errors {
            tracing::error!(field = %e.field, "{}", e.message);
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.runtime.worker_threads > 0 {
        runtime.worker_threads(config.runtime.worker_threads);
    }
    let runtime = runtime.build()?;

    let watched = cli.config.map(|path| (path, file_config));
    runtime.block_on(run(config, watched))
}

/// `watched` pairs the config file with its contents as loaded, before
/// command-line overrides.
async fn run(
    config: ProxyConfig,
    watched: Option<(PathBuf, ProxyConfig)>,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = ProxyServer::new(config.clone())?;
    if let Some(authority) = server.certificate_authority() {
        tracing::info!("TLS interception enabled, clients must trust the proxy root certificate");
        tracing::debug!(root = %authority.ca_cert_pem(), "Proxy root certificate");
    }

    // Kept alive for the lifetime of the server.
    let _watcher = match &watched {
        Some((path, file_config)) => match ConfigWatcher::new(path, server.authorization_gate(), file_config).run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, credentials will not reload");
                None
            }
        },
        None => None,
    };

    let addr = server.start(config.listener.bind_mode).await?;
    tracing::info!(address = %addr, "Listening for connections");

    signals::stop_on_signal(&server).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

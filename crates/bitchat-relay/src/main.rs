#![forbid(unsafe_code)]

//! Bitchat relay daemon.
//!
//! Terminates TLS client sessions from nearby phones, admits them through
//! a proof-of-work handshake, and carries opaque packets between local
//! clients and sibling relays on the batman-adv mesh. Payloads are never
//! inspected; the relay routes, deduplicates, buffers, and authenticates.

mod handshake;
mod mesh;
mod router;
mod session;

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{RelayConfig, TokenBucket};
use relay_crypto::{RelayAuth, RelayIdentity};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use mesh::MeshLink;
use router::Router;
use session::{run_reader, run_writer, Session};

const CRL_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "bitchat-relay")]
#[command(about = "WiFi mesh relay daemon for bitchat clients")]
struct Args {
    /// JSON configuration file. When given, it replaces all other
    /// configuration flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// TLS listen port for client sessions
    #[arg(long, default_value_t = relay_core::config::DEFAULT_TLS_PORT)]
    tls_port: u16,

    /// Mesh datagram port
    #[arg(long, default_value_t = relay_core::config::DEFAULT_MESH_PORT)]
    mesh_port: u16,

    /// Mesh multicast group
    #[arg(long, default_value_t = relay_core::config::DEFAULT_MESH_MULTICAST)]
    mesh_multicast: Ipv4Addr,

    /// Mesh network interface
    #[arg(long, default_value = relay_core::config::DEFAULT_MESH_INTERFACE)]
    mesh_interface: String,

    /// Directory for the TLS certificate and key
    #[arg(long, default_value = ".")]
    cert_dir: PathBuf,

    /// Directory for the relay identity, certificate, and CRL
    #[arg(long, default_value = ".")]
    key_dir: PathBuf,

    /// Maximum concurrent client sessions
    #[arg(long, default_value_t = relay_core::config::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Required leading zero bits in the proof-of-work hash
    #[arg(long, default_value_t = relay_core::config::DEFAULT_POW_DIFFICULTY)]
    pow_difficulty: u8,

    /// Permitted client attestation hash (hex), repeatable; none accepts any
    #[arg(long = "allowed-cert-hash")]
    allowed_cert_hashes: Vec<String>,

    /// Hex CA root public key; enables CA mode on the mesh
    #[arg(long)]
    ca_pubkey: Option<String>,

    /// Revocation list file, polled for changes
    #[arg(long)]
    crl_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig> {
        if let Some(path) = &self.config {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config: RelayConfig = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            return Ok(normalize(config));
        }

        Ok(normalize(RelayConfig {
            tls_port: self.tls_port,
            mesh_port: self.mesh_port,
            mesh_multicast: self.mesh_multicast,
            mesh_interface: self.mesh_interface,
            cert_dir: self.cert_dir,
            key_dir: self.key_dir,
            max_clients: self.max_clients,
            pow_difficulty: self.pow_difficulty,
            allowed_cert_hashes: self.allowed_cert_hashes.into_iter().collect(),
            ca_pubkey: self.ca_pubkey,
            crl_path: self.crl_path,
            ..RelayConfig::default()
        }))
    }
}

/// Attestation hashes compare against lowercase hex.
fn normalize(mut config: RelayConfig) -> RelayConfig {
    config.allowed_cert_hashes = config
        .allowed_cert_hashes
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = format!("{},rustls=warn", args.log_level);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting bitchat-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(args.into_config()?);

    let identity = RelayIdentity::load_or_generate(&config.key_dir)?;
    info!("relay identity {}", identity.public_key_hex());

    let auth = Arc::new(RelayAuth::new(
        identity,
        config.ca_pubkey.as_deref(),
        &config.key_dir,
        config.crl_path.clone(),
    )?);
    if auth.has_ca() {
        info!("mesh trust: CA mode");
    } else {
        info!("mesh trust: open (no CA configured)");
    }

    // Listener startup failures are fatal; supervision restarts us.
    let tls_config = relay_crypto::tls::server_config(&config.cert_dir)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let listener = TcpListener::bind(("0.0.0.0", config.tls_port))
        .await
        .with_context(|| format!("failed to bind TLS listener on port {}", config.tls_port))?;
    info!("listening for clients on :{}", config.tls_port);

    let router = Arc::new(Router::new(&config));

    // The mesh is best-effort: without it the relay still serves local
    // clients in standalone mode.
    match MeshLink::start(&config, auth.clone(), router.clone()).await {
        Ok(link) => router.attach_mesh(link),
        Err(e) => warn!("mesh unavailable, running standalone: {e:#}"),
    }

    if config.crl_path.is_some() {
        tokio::spawn(poll_crl(auth.clone()));
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = accepted.context("accept failed")?;
                if router.client_count() >= config.max_clients {
                    warn!("rejecting {remote}: at capacity ({} clients)", config.max_clients);
                    continue;
                }
                tokio::spawn(handle_connection(
                    stream,
                    remote,
                    acceptor.clone(),
                    router.clone(),
                    config.clone(),
                ));
            }
        }
    }

    Ok(())
}

/// Drive one client connection from TLS accept to disconnect.
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    router: Arc<Router>,
    config: Arc<RelayConfig>,
) {
    let mut tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!("TLS accept from {remote} failed: {e}");
            return;
        }
    };

    let peer_id = match timeout(
        config.handshake_timeout(),
        handshake::perform(&mut tls_stream, &config),
    )
    .await
    {
        Ok(Ok(peer_id)) => peer_id,
        Ok(Err(e)) => {
            warn!("handshake with {remote} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("handshake with {remote} timed out");
            return;
        }
    };

    let (read_half, write_half) = tokio::io::split(tls_stream);
    let bucket = TokenBucket::new(config.client_packets_per_sec, config.client_burst_size);
    let (session, outbound_rx) = Session::new(peer_id, remote, bucket);
    info!(session = %session.id(), peer = %session.peer_id(), "client connected from {remote}");

    // Writer first so store-and-forward frames start draining as soon as
    // registration enqueues them.
    let writer = tokio::spawn(run_writer(write_half, outbound_rx, session.clone()));
    router.add_session(session.clone());

    run_reader(read_half, session.clone(), router.clone(), config.clone()).await;

    router.remove_session(session.id());
    session.close();
    let _ = writer.await;
    info!(peer = %session.peer_id(), "client {remote} disconnected");
}

/// Re-read the CRL whenever its modification time advances.
async fn poll_crl(auth: Arc<RelayAuth>) {
    let mut interval = tokio::time::interval(CRL_POLL_INTERVAL);
    // The constructor already loaded the CRL once; skip the immediate tick.
    interval.tick().await;
    loop {
        interval.tick().await;
        match auth.reload_crl_if_changed() {
            Ok(true) => debug!("revocation list reloaded"),
            Ok(false) => {}
            Err(e) => warn!("revocation list reload failed: {e}"),
        }
    }
}

//! Backhaul CLI
//!
//! Run a relay, or register a local HTTP service with one.

use anyhow::{Context, Result};
use backhaul_client::{ClientConfig, ClientError, TransportKind, TunnelClient};
use backhaul_relay::{MemoryStorage, ServerConfig, TunnelServer};
use backhaul_transport::TransportListener;
use backhaul_transport_h2::{H2Config, H2Listener};
use backhaul_transport_quic::{QuicConfig, QuicListener};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - expose HTTP services through a relay they dial out to
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a relay: accept backends and serve public HTTP for their domains
    Relay {
        /// Address backends dial
        #[arg(long, env = "BACKHAUL_TUNNEL_ADDR", default_value = "0.0.0.0:4443")]
        tunnel_addr: SocketAddr,

        /// Public HTTP address
        #[arg(long, env = "BACKHAUL_HTTP_ADDR", default_value = "0.0.0.0:8080")]
        http_addr: SocketAddr,

        /// Backend transport: tcp, tls or quic
        #[arg(long, env = "BACKHAUL_TRANSPORT", default_value = "tls")]
        transport: TransportKind,

        /// PEM certificate for tls/quic; a self-signed one is generated when unset
        #[arg(long, env = "BACKHAUL_TLS_CERT", requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// PEM private key matching --tls-cert
        #[arg(long, env = "BACKHAUL_TLS_KEY", requires = "tls_cert")]
        tls_key: Option<PathBuf>,

        /// JSON file with tokens and routes
        #[arg(long, env = "BACKHAUL_STORAGE")]
        storage: PathBuf,
    },

    /// Register a local HTTP service with a relay
    Connect {
        /// Relay tunnel address (host:port)
        #[arg(long, env = "BACKHAUL_RELAY")]
        relay: String,

        /// Transport: tcp, tls or quic
        #[arg(long, env = "BACKHAUL_TRANSPORT", default_value = "tls")]
        transport: TransportKind,

        /// Authentication token
        #[arg(long, env = "BACKHAUL_TOKEN")]
        token: String,

        /// Domain to serve
        #[arg(long, env = "BACKHAUL_DOMAIN")]
        domain: String,

        /// Local service URL (e.g. http://127.0.0.1:3000)
        #[arg(long, env = "BACKHAUL_BACKEND")]
        backend: String,

        /// Skip relay certificate verification (development only)
        #[arg(long, env = "BACKHAUL_INSECURE")]
        insecure: bool,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Certificate and key for the relay, generating a development pair if none was given
fn relay_identity(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<(PathBuf, PathBuf)> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok((cert, key)),
        _ => {
            warn!("No --tls-cert given, using a self-signed certificate");
            backhaul_cert::load_or_generate(Path::new(".backhaul"), "relay")
                .context("Failed to prepare self-signed certificate")
        }
    }
}

async fn serve<L>(server: Arc<TunnelServer>, listener: L, http: TcpListener) -> Result<()>
where
    L: TransportListener,
{
    let front = tokio::spawn({
        let server = server.clone();
        async move { server.serve_http(http).await }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            server.close();
        }
        _ = server.listen(listener) => {}
    }

    server.close();
    front
        .await
        .context("HTTP front end panicked")?
        .context("HTTP front end failed")?;
    Ok(())
}

async fn run_relay(
    tunnel_addr: SocketAddr,
    http_addr: SocketAddr,
    transport: TransportKind,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    storage: PathBuf,
) -> Result<()> {
    let storage = MemoryStorage::from_json_file(&storage)
        .with_context(|| format!("Failed to load storage from {}", storage.display()))?;
    let server = TunnelServer::new(ServerConfig::default(), Arc::new(storage))
        .context("Invalid relay configuration")?
        .start();

    let http = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP address {}", http_addr))?;
    info!("Serving public HTTP on {}", http_addr);

    match transport {
        TransportKind::Tcp => {
            warn!("Backends connect over plain TCP; tokens travel unencrypted");
            let listener = H2Listener::bind(tunnel_addr, Arc::new(H2Config::plain()))
                .await
                .context("Failed to bind tunnel listener")?;
            serve(server, listener, http).await
        }
        TransportKind::Tls => {
            let (cert, key) = relay_identity(tls_cert, tls_key)?;
            let listener = H2Listener::bind(tunnel_addr, Arc::new(H2Config::server_tls(cert, key)))
                .await
                .context("Failed to bind TLS tunnel listener")?;
            serve(server, listener, http).await
        }
        TransportKind::Quic => {
            let (cert, key) = relay_identity(tls_cert, tls_key)?;
            let listener = QuicListener::new(tunnel_addr, Arc::new(QuicConfig::server_default(cert, key)))
                .context("Failed to bind QUIC tunnel listener")?;
            serve(server, listener, http).await
        }
    }
}

/// Reconnect bookkeeping: consecutive failures and the next delay
///
/// A session that stayed up longer than the initial delay counts as a
/// recovery and starts the schedule over.
#[derive(Debug)]
struct Backoff {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    failures: usize,
    next_delay: Duration,
}

impl Backoff {
    fn new(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            failures: 0,
            next_delay: initial_delay,
        }
    }

    /// Record a dropped session; `None` once the attempts are used up
    fn on_disconnect(&mut self, session_lasted: Duration) -> Option<Duration> {
        if session_lasted > self.initial_delay {
            self.failures = 0;
            self.next_delay = self.initial_delay;
        }

        self.failures += 1;
        if self.max_attempts > 0 && self.failures >= self.max_attempts {
            return None;
        }

        let delay = self.next_delay;
        self.next_delay = std::cmp::min(self.next_delay * 2, self.max_delay);
        Some(delay)
    }
}

/// Keep the client connected, backing off exponentially between attempts
async fn connect_with_reconnect(
    client: TunnelClient,
    cancel: CancellationToken,
    mut backoff: Backoff,
) -> Result<()> {
    loop {
        let started = tokio::time::Instant::now();

        match client.connect(cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(e @ ClientError::Config(_)) => return Err(e).context("Invalid client configuration"),
            Err(e) => error!("Tunnel error: {}", e),
        }

        let Some(delay) = backoff.on_disconnect(started.elapsed()) else {
            anyhow::bail!(
                "Failed to stay connected after {} attempts",
                backoff.max_attempts
            );
        };

        warn!(
            "Reconnecting in {}s (attempt {})",
            delay.as_secs(),
            backoff.failures + 1
        );

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Relay {
            tunnel_addr,
            http_addr,
            transport,
            tls_cert,
            tls_key,
            storage,
        } => run_relay(tunnel_addr, http_addr, transport, tls_cert, tls_key, storage).await,

        Commands::Connect {
            relay,
            transport,
            token,
            domain,
            backend,
            insecure,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            if insecure {
                warn!("Certificate verification disabled (insecure mode)");
            }

            let config = ClientConfig::new(transport, relay, token, domain, backend)
                .with_insecure(insecure);
            let client = TunnelClient::new(config).context("Invalid client configuration")?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            info!("Received Ctrl+C, shutting down...");
                            cancel.cancel();
                        }
                        Err(e) => warn!("Can't listen for Ctrl+C: {}", e),
                    }
                }
            });

            let backoff = Backoff::new(
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            );
            connect_with_reconnect(client, cancel, backoff).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;

        let command = Cli::command();
        command.clone().debug_assert();

        let version = command.get_version().unwrap().to_string();
        assert!(version.contains(env!("GIT_HASH")));
        assert!(version.contains(env!("BUILD_TIME")));
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(0, SECOND, 4 * SECOND);
        let delays: Vec<_> = (0..4)
            .map(|_| backoff.on_disconnect(Duration::ZERO).unwrap())
            .collect();
        assert_eq!(delays, vec![SECOND, 2 * SECOND, 4 * SECOND, 4 * SECOND]);
    }

    #[test]
    fn test_backoff_gives_up_after_max_attempts() {
        let mut backoff = Backoff::new(2, SECOND, 60 * SECOND);
        assert_eq!(backoff.on_disconnect(Duration::ZERO), Some(SECOND));
        assert_eq!(backoff.on_disconnect(Duration::ZERO), None);
    }

    #[test]
    fn test_backoff_resets_after_long_session() {
        let mut backoff = Backoff::new(3, SECOND, 60 * SECOND);
        backoff.on_disconnect(Duration::ZERO);
        assert_eq!(backoff.on_disconnect(Duration::ZERO), Some(2 * SECOND));

        // A session that served for a while is a fresh start
        assert_eq!(backoff.on_disconnect(Duration::from_secs(600)), Some(SECOND));
        assert_eq!(backoff.on_disconnect(Duration::ZERO), Some(2 * SECOND));
        assert_eq!(backoff.on_disconnect(Duration::ZERO), None);
    }
}

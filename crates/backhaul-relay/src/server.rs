//! Tunnel server: admits backends, keeps them healthy, and routes requests
//!
//! Every accepted transport connection gets its own task. That task runs the
//! handshake, registers the resulting [`Connection`], then pings it until it
//! is cancelled, at which point it unregisters and closes it.

use backhaul_proto::REQUEST_ID_HEADER;
use backhaul_transport::{Handshake, SharedSession, TransportError, TransportListener};
use bytes::Bytes;
use http::{header, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthError, Authenticator};
use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::detector::{DetectorFactory, PhiAccrualFactory};
use crate::error::RelayError;
use crate::fallback;
use crate::registry::Registry;
use crate::selector::{BackendSelector, RandomSelector};
use crate::storage::Storage;

/// Body of every response the relay hands back
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub struct TunnelServer {
    config: ServerConfig,
    registry: Registry,
    authenticator: Authenticator,
    selector: Box<dyn BackendSelector>,
    detector_factory: Box<dyn DetectorFactory>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("config", &self.config)
            .field("backends", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TunnelServer {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self, RelayError> {
        config.validate()?;

        Ok(Self {
            config,
            registry: Registry::new(),
            authenticator: Authenticator::new(storage),
            selector: Box::new(RandomSelector),
            detector_factory: Box::new(PhiAccrualFactory::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_selector(mut self, selector: impl BackendSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn with_detector_factory(mut self, factory: impl DetectorFactory + 'static) -> Self {
        self.detector_factory = Box::new(factory);
        self
    }

    /// Share the server and start the phi inspection loop
    pub fn start(self) -> Arc<Self> {
        let server = Arc::new(self);
        spawn_phi_monitor(&server);
        server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Accept backend connections until the server is closed
    pub async fn listen<L>(self: &Arc<Self>, listener: L)
    where
        L: TransportListener,
    {
        match listener.local_addr() {
            Ok(addr) => info!(proto = listener.protocol(), "Tunnel listener on {}", addr),
            Err(e) => warn!(proto = listener.protocol(), "Tunnel listener address unknown: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(handshake) => {
                    tokio::spawn(self.clone().handle_connection(handshake));
                }
                Err(e) => {
                    error!("Failed to accept backend connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        debug!(proto = listener.protocol(), "Tunnel listener stopped");
    }

    async fn handle_connection(self: Arc<Self>, handshake: Handshake) {
        let remote = handshake.peer_addr();

        let admitted = tokio::time::timeout(self.config.auth_timeout, self.admit(handshake)).await;
        let connection = match admitted {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                error!(remote = %remote, "Backend handshake failed: {}", e);
                return;
            }
            Err(_) => {
                error!(remote = %remote, "Backend handshake failed: {}", AuthError::Timeout);
                return;
            }
        };

        info!(
            backend_id = %connection.id(),
            domain = %connection.domain(),
            user = %connection.user(),
            remote = %remote,
            proto = connection.protocol(),
            "Backend connected"
        );

        self.registry.add(connection.clone());
        connection.mark_usable();

        self.supervise(&connection).await;

        self.registry.remove(&connection);
        connection.close().await;

        info!(
            backend_id = %connection.id(),
            domain = %connection.domain(),
            hits = connection.hits(),
            "Backend removed"
        );
    }

    /// Establish the session and authenticate it
    async fn admit(&self, handshake: Handshake) -> Result<Arc<Connection>, HandshakeError> {
        let session = handshake.establish().await?;

        match self.authenticate(&session).await {
            Ok((control, user, domain)) => Ok(Arc::new(Connection::new(
                session,
                control,
                user,
                domain,
                self.detector_factory.create(),
                &self.shutdown,
                &self.config,
            ))),
            Err(e) => {
                session.close("handshake failed").await;
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        session: &SharedSession,
    ) -> Result<(backhaul_transport::BoxedStream, String, String), HandshakeError> {
        let mut control = session.open_stream().await?;
        let (user, auth) = self.authenticator.authenticate(&mut control).await?;
        Ok((control, user, auth.domain))
    }

    /// Ping the connection on every health period until it is cancelled
    async fn supervise(&self, connection: &Connection) {
        let period = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = connection.cancelled() => {
                    // Server shutdown reaches here without going through cancel()
                    connection.cancel();
                    break;
                }
                _ = connection.session().closed() => {
                    debug!(backend_id = %connection.id(), "Backend session closed by peer");
                    connection.cancel();
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = connection.ping().await {
                        // Killed or shut down while the ping was in flight
                        if connection.is_cancelled() {
                            debug!(backend_id = %connection.id(), "Ping aborted: {}", e);
                            break;
                        }
                        warn!(
                            backend_id = %connection.id(),
                            domain = %connection.domain(),
                            "Health check failed: {}", e
                        );
                        connection.cancel();
                        break;
                    }
                }
            }
        }
    }

    /// Route one request to a usable backend of its host
    ///
    /// Hosts without a usable backend get the 502 fallback page, never an
    /// error. A failed exchange cancels the backend it ran on and is returned
    /// as is; it is not retried on a sibling.
    pub async fn round_trip<B>(&self, req: Request<B>) -> Result<Response<RelayBody>, RelayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let host = request_host(&req);
        let domain = routing_key(&host);

        let candidates: Vec<_> = self
            .registry
            .snapshot_domain(&domain)
            .into_iter()
            .filter(|connection| connection.is_usable())
            .collect();

        let Some(connection) = self.selector.select(&candidates).cloned() else {
            let request_id = request_id(&req);
            debug!(domain = %domain, request_id = %request_id, "No usable backend");
            return Ok(fallback_response(&host, &request_id));
        };

        trace!(backend_id = %connection.id(), domain = %domain, "Routing request");

        match connection.round_trip(req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(RelayError::Cancelled) => Err(RelayError::Cancelled),
            Err(e) => {
                warn!(
                    backend_id = %connection.id(),
                    domain = %domain,
                    "Round trip failed, dropping backend: {}", e
                );
                connection.cancel();
                Err(e)
            }
        }
    }

    pub fn all_backends(&self) -> Vec<Backend> {
        self.registry
            .snapshot_all()
            .iter()
            .map(|connection| connection.snapshot())
            .collect()
    }

    pub fn backends_for_domain(&self, domain: &str) -> Vec<Backend> {
        self.registry
            .snapshot_domain(&domain.to_ascii_lowercase())
            .iter()
            .map(|connection| connection.snapshot())
            .collect()
    }

    pub fn backends_for_user(&self, user: &str) -> Vec<Backend> {
        self.registry
            .snapshot_all()
            .iter()
            .filter(|connection| connection.user() == user)
            .map(|connection| connection.snapshot())
            .collect()
    }

    /// Disconnect one backend. It may reconnect as a new backend afterwards.
    pub fn kill_backend(&self, id: &str) -> Result<(), RelayError> {
        let connection = self.registry.find(id).ok_or(RelayError::NoSuchBackend)?;

        self.registry.remove(&connection);
        connection.cancel();

        info!(backend_id = %id, domain = %connection.domain(), "Backend killed");
        Ok(())
    }

    /// Cancel every connection and stop the listeners
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(backends = self.registry.len(), "Shutting down tunnel server");
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn wait(&self) {
        self.shutdown.cancelled().await
    }
}

fn spawn_phi_monitor(server: &Arc<TunnelServer>) {
    let weak: Weak<TunnelServer> = Arc::downgrade(server);
    let shutdown = server.shutdown.clone();
    let period = server.config.phi_check_interval;
    let threshold = server.config.phi_threshold;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(server) = weak.upgrade() else {
                break;
            };

            let now = Instant::now();
            for connection in server.registry.snapshot_all() {
                let phi = connection.phi(now);
                if phi > threshold {
                    warn!(
                        backend_id = %connection.id(),
                        domain = %connection.domain(),
                        phi,
                        "Backend phi above threshold"
                    );
                }
            }
        }

        trace!("Phi monitor stopped");
    });
}

/// Host as the caller sent it: URI authority first, then the Host header
pub(crate) fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.as_str().to_string();
    }

    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Registry key for a host: port stripped, no trailing dot, lowercase
pub(crate) fn routing_key(host: &str) -> String {
    let name = match host.parse::<http::uri::Authority>() {
        Ok(authority) => authority.host().to_string(),
        Err(_) => host.to_string(),
    };

    name.trim_end_matches('.').to_ascii_lowercase()
}

pub(crate) fn fallback_response(host: &str, request_id: &str) -> Response<RelayBody> {
    fallback::response(host, request_id).map(|body| body.map_err(|never| match never {}).boxed())
}

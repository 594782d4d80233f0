//! One authenticated backend link and the HTTP exchanges carried over it

use backhaul_proto::HEALTH_PATH;
use backhaul_transport::{BoxedStream, SharedSession};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderValue, Request, Response, Uri, Version};
use http_body_util::Empty;
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::detector::FailureDetector;
use crate::error::{RelayError, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Authenticated, not yet in the registry
    Pending,
    Usable,
    /// Terminal
    Closed,
}

#[derive(Debug)]
struct State {
    lifecycle: Lifecycle,
    detector: Box<dyn FailureDetector>,
}

/// An authenticated backend session
///
/// Routable only between [`mark_usable`](Self::mark_usable) and
/// [`cancel`](Self::cancel); once cancelled it never becomes usable again.
pub struct Connection {
    id: String,
    user: String,
    domain: String,
    session: SharedSession,
    control_stream: tokio::sync::Mutex<Option<BoxedStream>>,
    state: Mutex<State>,
    hits: AtomicU64,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    open_stream_timeout: Duration,
    ping_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("session", &self.session.session_id())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build a pending connection whose cancellation follows `parent`
    pub fn new(
        session: SharedSession,
        control_stream: BoxedStream,
        user: impl Into<String>,
        domain: impl Into<String>,
        detector: Box<dyn FailureDetector>,
        parent: &CancellationToken,
        config: &ServerConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            domain: domain.into(),
            session,
            control_stream: tokio::sync::Mutex::new(Some(control_stream)),
            state: Mutex::new(State {
                lifecycle: Lifecycle::Pending,
                detector,
            }),
            hits: AtomicU64::new(0),
            cancel: parent.child_token(),
            connected_at: Utc::now(),
            open_stream_timeout: config.open_stream_timeout,
            ping_timeout: config.ping_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn protocol(&self) -> &'static str {
        self.session.protocol()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.session.remote_address()
    }

    /// Successful round trips served so far
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether new requests may be routed here
    ///
    /// A cancelled parent token makes the connection unusable even before
    /// its own task notices.
    pub fn is_usable(&self) -> bool {
        self.state().lifecycle == Lifecycle::Usable && !self.cancel.is_cancelled()
    }

    /// Make a pending connection routable. Returns false if it was already
    /// cancelled.
    pub fn mark_usable(&self) -> bool {
        let mut state = self.state();
        if state.lifecycle != Lifecycle::Pending {
            return false;
        }
        state.lifecycle = Lifecycle::Usable;
        true
    }

    /// Take the connection out of rotation and fire its cancellation token
    pub fn cancel(&self) {
        let was_closed = {
            let mut state = self.state();
            let was_closed = state.lifecycle == Lifecycle::Closed;
            state.lifecycle = Lifecycle::Closed;
            was_closed
        };

        if !was_closed {
            debug!(backend_id = %self.id, domain = %self.domain, "Connection cancelled");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn phi(&self, now: Instant) -> f64 {
        self.state().detector.phi(now)
    }

    pub fn snapshot(&self) -> Backend {
        let (usable, phi) = {
            let state = self.state();
            (
                state.lifecycle == Lifecycle::Usable && !self.cancel.is_cancelled(),
                state.detector.phi(Instant::now()),
            )
        };

        Backend {
            id: self.id.clone(),
            proto: self.protocol().to_string(),
            user: self.user.clone(),
            domain: self.domain.clone(),
            phi,
            host: self.remote_address().to_string(),
            usable,
            hits: self.hits(),
            connected_at: self.connected_at,
        }
    }

    /// Open a fresh session stream, bounded by the open-stream deadline
    pub async fn open_stream(&self) -> Result<BoxedStream, StreamError> {
        if !self.is_usable() {
            return Err(StreamError::Unusable);
        }

        match tokio::time::timeout(self.open_stream_timeout, self.session.open_stream()).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(StreamError::Timeout),
        }
    }

    /// Send one request over a new stream and return its response
    ///
    /// A [`CancellationToken`] in the request extensions bounds the stream:
    /// once it fires the stream is dropped and the exchange fails with
    /// [`RelayError::Cancelled`].
    pub async fn round_trip<B>(&self, req: Request<B>) -> Result<Response<Incoming>, RelayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let response = self.exchange(req).await?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }

    /// Check the backend with `GET /health` and record a heartbeat on success
    ///
    /// Any HTTP response counts as alive.
    pub async fn ping(&self) -> Result<(), RelayError> {
        let ping_cancel = CancellationToken::new();
        let _guard = ping_cancel.clone().drop_guard();

        let mut req = Request::new(Empty::<Bytes>::new());
        *req.uri_mut() = Uri::from_static(HEALTH_PATH);
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_static("backend"));
        req.extensions_mut().insert(ping_cancel);

        match tokio::time::timeout(self.ping_timeout, self.exchange(req)).await {
            Ok(Ok(response)) => {
                trace!(backend_id = %self.id, status = %response.status(), "Ping answered");
                self.state().detector.heartbeat(Instant::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::PingTimeout),
        }
    }

    async fn exchange<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, RelayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_cancel = req.extensions().get::<CancellationToken>().cloned();
        into_origin_form(&mut req);

        let stream = self
            .open_stream()
            .await
            .map_err(RelayError::CantOpenSessionStream)?;

        let write_failed = Arc::new(AtomicBool::new(false));
        let io = TrackedIo::new(stream, write_failed.clone());

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(RelayError::CantWriteRequest)?;

        let connection_cancel = self.cancel.clone();
        let stream_cancel = request_cancel.clone();
        let backend_id = self.id.clone();
        tokio::spawn(async move {
            let request_gone = async {
                match stream_cancel {
                    Some(token) => token.cancelled_owned().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        trace!(backend_id = %backend_id, "Stream ended: {}", e);
                    }
                }
                _ = request_gone => {
                    trace!(backend_id = %backend_id, "Request cancelled, dropping stream");
                }
                _ = connection_cancel.cancelled() => {
                    trace!(backend_id = %backend_id, "Connection cancelled, dropping stream");
                }
            }
        });

        let result = sender.send_request(req).await;
        drop(sender);

        match result {
            Ok(response) => Ok(response),
            Err(_) if request_cancel.as_ref().is_some_and(|token| token.is_cancelled()) => {
                Err(RelayError::Cancelled)
            }
            Err(e)
                if write_failed.load(Ordering::Acquire)
                    || e.is_user()
                    || e.is_body_write_aborted() =>
            {
                Err(RelayError::CantWriteRequest(e))
            }
            Err(e) => Err(RelayError::CantReadResponse(e)),
        }
    }

    /// Release the control stream and the session. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(mut control) = self.control_stream.lock().await.take() {
            if let Err(e) = control.shutdown().await {
                trace!(backend_id = %self.id, "Control stream shutdown failed: {}", e);
            }
        }
        self.session.close("backend removed").await;
    }
}

/// Rewrite a proxied request into the origin form an HTTP/1.1 stream expects
fn into_origin_form<B>(req: &mut Request<B>) {
    if !req.headers().contains_key(header::HOST) {
        let host = req
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
        if let Some(host) = host {
            req.headers_mut().insert(header::HOST, host);
        }
    }

    let origin = match req.uri().path_and_query() {
        Some(path) => Uri::from(path.clone()),
        None => Uri::from_static("/"),
    };
    *req.uri_mut() = origin;
    *req.version_mut() = Version::HTTP_11;
}

/// Stream wrapper remembering whether any write failed, which separates
/// "couldn't send the request" from "couldn't read the response"
struct TrackedIo {
    inner: BoxedStream,
    write_failed: Arc<AtomicBool>,
}

impl TrackedIo {
    fn new(inner: BoxedStream, write_failed: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            write_failed,
        }
    }

    fn track<T>(&self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(_)) = &poll {
            self.write_failed.store(true, Ordering::Release);
        }
        poll
    }
}

impl AsyncRead for TrackedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.track(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.track(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.track(poll)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::PhiAccrualDetector;
    use backhaul_transport::MemorySession;

    /// A pending connection over an in-memory session, plus the peer side
    pub(crate) fn test_connection(domain: &str) -> (Arc<Connection>, SharedSession) {
        test_connection_with(domain, &CancellationToken::new(), &ServerConfig::default())
    }

    pub(crate) fn test_connection_with(
        domain: &str,
        parent: &CancellationToken,
        config: &ServerConfig,
    ) -> (Arc<Connection>, SharedSession) {
        let (relay, backend) = MemorySession::pair();
        let (control, _peer) = tokio::io::duplex(64);
        let connection = Connection::new(
            relay,
            Box::new(control),
            "shachi",
            domain,
            Box::new(PhiAccrualDetector::default()),
            parent,
            config,
        );
        (Arc::new(connection), backend)
    }

    /// Answer every stream on `backend` with a fixed status, one exchange each
    fn serve(backend: SharedSession, status: u16) {
        tokio::spawn(async move {
            while let Ok(Some(stream)) = backend.accept_stream().await {
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |_req| async move {
                        let mut response = Response::new(http_body_util::Full::new(
                            Bytes::from_static(b"ok"),
                        ));
                        *response.status_mut() = http::StatusCode::from_u16(status).unwrap();
                        Ok::<_, std::convert::Infallible>(response)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let (connection, _backend) = test_connection("cetacean.club");
        assert!(!connection.is_usable());

        assert!(connection.mark_usable());
        assert!(connection.is_usable());
        assert!(!connection.mark_usable());

        connection.cancel();
        assert!(!connection.is_usable());
        assert!(connection.is_cancelled());
        assert!(!connection.mark_usable());

        // Repeated cancel is harmless
        connection.cancel();
        assert!(!connection.is_usable());
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let (connection, _backend) =
            test_connection_with("cetacean.club", &parent, &ServerConfig::default());

        parent.cancel();
        connection.cancelled().await;
        assert!(connection.is_cancelled());
    }

    #[tokio::test]
    async fn test_open_stream_requires_usable() {
        let (connection, _backend) = test_connection("cetacean.club");
        assert!(matches!(
            connection.open_stream().await,
            Err(StreamError::Unusable)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_counts_hits() {
        let (connection, backend) = test_connection("cetacean.club");
        connection.mark_usable();
        serve(backend, 200);

        let req = Request::get("http://cetacean.club/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = connection.round_trip(req).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(connection.hits(), 1);
    }

    #[tokio::test]
    async fn test_ping_records_heartbeat_without_hits() {
        let (connection, backend) = test_connection("cetacean.club");
        connection.mark_usable();
        serve(backend, 404);

        connection.ping().await.unwrap();
        connection.ping().await.unwrap();
        assert_eq!(connection.hits(), 0);
        assert!(connection.phi(Instant::now()) < 0.9);
    }

    #[tokio::test]
    async fn test_ping_timeout_on_silent_backend() {
        let config = ServerConfig::default().with_ping_timeout(Duration::from_millis(100));
        let (connection, backend) =
            test_connection_with("cetacean.club", &CancellationToken::new(), &config);
        connection.mark_usable();

        // Accept streams but never answer
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(Some(stream)) = backend.accept_stream().await {
                held.push(stream);
            }
        });

        assert!(matches!(
            connection.ping().await,
            Err(RelayError::PingTimeout)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_connection_alone() {
        let (connection, backend) = test_connection("cetacean.club");
        connection.mark_usable();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(Some(stream)) = backend.accept_stream().await {
                held.push(stream);
            }
        });

        let token = CancellationToken::new();
        let mut req = Request::get("/slow").body(Empty::<Bytes>::new()).unwrap();
        req.extensions_mut().insert(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        assert!(matches!(
            connection.round_trip(req).await,
            Err(RelayError::Cancelled)
        ));
        canceller.await.unwrap();
        assert!(connection.is_usable());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, backend) = test_connection("cetacean.club");
        connection.close().await;
        connection.close().await;
        assert!(connection.session().is_closed());
        backend.closed().await;
    }

    #[test]
    fn test_origin_form() {
        let mut req = Request::get("http://Cetacean.Club:8080/a/b?c=d")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        into_origin_form(&mut req);

        assert_eq!(req.uri(), "/a/b?c=d");
        assert_eq!(req.headers()[header::HOST], "Cetacean.Club:8080");
        assert_eq!(req.version(), Version::HTTP_11);
    }
}

//! HTTP/2 session implementations
//!
//! Roles are reversed relative to ordinary HTTP: the relay needs to open
//! streams, so it runs the HTTP/2 client over the socket it accepted, and the
//! backend runs the HTTP/2 server over the socket it dialed. Opening a stream
//! is a `POST /stream` whose body stays open; the peer answers `200` with an
//! open body and the two DATA directions carry the bytes.

use async_trait::async_trait;
use backhaul_transport::{BoxedStream, MuxSession, TransportError, TransportResult};
use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::H2Config;
use crate::stream::H2Stream;

const STREAM_URI: &str = "https://backhaul/stream";

/// Addressing details shared by both session ends
#[derive(Debug, Clone)]
pub(crate) struct SessionInfo {
    pub session_id: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: SocketAddr,
    pub protocol: &'static str,
}

/// Relay end of an HTTP/2 session (opens streams)
pub struct H2RelaySession {
    info: SessionInfo,
    send_request: Mutex<SendRequest<Bytes>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for H2RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2RelaySession")
            .field("session_id", &self.info.session_id)
            .field("remote_addr", &self.info.remote_addr)
            .finish()
    }
}

impl H2RelaySession {
    pub(crate) async fn establish<T>(
        io: T,
        info: SessionInfo,
        config: &H2Config,
    ) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_request, h2_conn) = config
            .relay_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let shutdown = CancellationToken::new();

        // Spawn connection driver
        let driver_shutdown = shutdown.clone();
        let session_id = info.session_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = h2_conn => {
                    if let Err(e) = result {
                        if !e.is_go_away() && !e.is_io() {
                            error!(session_id = %session_id, "H2 connection error: {}", e);
                        }
                    }
                }
                _ = driver_shutdown.cancelled() => {}
            }
            debug!(session_id = %session_id, "H2 connection closed");
            driver_shutdown.cancel();
        });

        Ok(Self {
            info,
            send_request: Mutex::new(send_request),
            shutdown,
        })
    }
}

#[async_trait]
impl MuxSession for H2RelaySession {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        // Clone to get a ready handle (SendRequest is Clone)
        let send_request = self.send_request.lock().await.clone();

        let mut ready_request = send_request.ready().await.map_err(|e| {
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(STREAM_URI)
            .body(())
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let (response, send_stream) = ready_request.send_request(request, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to open stream: {}", e))
        })?;

        let response = response.await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to get response: {}", e))
        })?;

        if response.status() != StatusCode::OK {
            return Err(TransportError::ProtocolError(format!(
                "Peer refused stream with {}",
                response.status()
            )));
        }

        let stream = H2Stream::new(send_stream, response.into_body());
        trace!(
            session_id = %self.info.session_id,
            stream_id = stream.stream_id(),
            "Opened stream"
        );

        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> TransportResult<Option<BoxedStream>> {
        // The HTTP/2 client role never receives streams
        self.shutdown.cancelled().await;
        Ok(None)
    }

    async fn close(&self, reason: &str) {
        debug!(session_id = %self.info.session_id, reason, "Closing session");
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    fn remote_address(&self) -> SocketAddr {
        self.info.remote_addr
    }

    fn protocol(&self) -> &'static str {
        self.info.protocol
    }

    fn session_id(&self) -> String {
        self.info.session_id.clone()
    }
}

impl Drop for H2RelaySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type IncomingStream = (Request<RecvStream>, SendResponse<Bytes>);

/// Backend end of an HTTP/2 session (accepts streams)
pub struct H2BackendSession {
    info: SessionInfo,
    accept_rx: Mutex<mpsc::Receiver<IncomingStream>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for H2BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2BackendSession")
            .field("session_id", &self.info.session_id)
            .field("remote_addr", &self.info.remote_addr)
            .finish()
    }
}

impl H2BackendSession {
    pub(crate) async fn establish<T>(
        io: T,
        info: SessionInfo,
        config: &H2Config,
    ) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut h2_conn = config
            .backend_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let (accept_tx, accept_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();

        // Spawn connection driver
        let driver_shutdown = shutdown.clone();
        let session_id = info.session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = driver_shutdown.cancelled() => break,
                    next = h2_conn.accept() => match next {
                        Some(Ok(incoming)) => {
                            if accept_tx.send(incoming).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            if !e.is_go_away() && !e.is_io() {
                                error!(session_id = %session_id, "H2 accept error: {}", e);
                            }
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!(session_id = %session_id, "H2 connection closed");
            driver_shutdown.cancel();
        });

        Ok(Self {
            info,
            accept_rx: Mutex::new(accept_rx),
            shutdown,
        })
    }
}

#[async_trait]
impl MuxSession for H2BackendSession {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        // HTTP/2 server role cannot initiate streams
        Err(TransportError::ProtocolError(
            "Backend end of an HTTP/2 session cannot open streams".to_string(),
        ))
    }

    async fn accept_stream(&self) -> TransportResult<Option<BoxedStream>> {
        let mut accept_rx = self.accept_rx.lock().await;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                next = accept_rx.recv() => next,
            };
            let Some((request, mut respond)) = next else {
                return Ok(None);
            };

            // Send response headers to establish bidirectional stream
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(())
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

            match respond.send_response(response, false) {
                Ok(send_stream) => {
                    let stream = H2Stream::new(send_stream, request.into_body());
                    trace!(
                        session_id = %self.info.session_id,
                        stream_id = stream.stream_id(),
                        "Accepted stream"
                    );
                    return Ok(Some(Box::new(stream)));
                }
                Err(e) => {
                    // Opener gave up before we answered
                    debug!(session_id = %self.info.session_id, "Dropping stale stream: {}", e);
                }
            }
        }
    }

    async fn close(&self, reason: &str) {
        debug!(session_id = %self.info.session_id, reason, "Closing session");
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    fn remote_address(&self) -> SocketAddr {
        self.info.remote_addr
    }

    fn protocol(&self) -> &'static str {
        self.info.protocol
    }

    fn session_id(&self) -> String {
        self.info.session_id.clone()
    }
}

impl Drop for H2BackendSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

//! QUIC session implementation

use async_trait::async_trait;
use backhaul_transport::{BoxedStream, MuxSession, TransportError, TransportResult};
use quinn::{Connection, RecvStream, SendStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// First byte on every opened stream. QUIC only announces a stream to the
/// peer once data flows on it.
const STREAM_PREFACE: u8 = 0x01;

/// QUIC bidirectional stream wrapper
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub fn stream_id(&self) -> u64 {
        self.send.id().index()
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicSession {
    inner: Connection,
    session_id: String,
    local_addr: Option<SocketAddr>,
}

impl QuicSession {
    pub fn new(connection: Connection, local_addr: Option<SocketAddr>) -> Self {
        let session_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            session_id,
            local_addr,
        }
    }
}

#[async_trait]
impl MuxSession for QuicSession {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        let (mut send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        send.write_all(&[STREAM_PREFACE])
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(session_id = %self.session_id, stream_id = send.id().index(), "Opened stream");

        Ok(Box::new(QuicStream::new(send, recv)))
    }

    async fn accept_stream(&self) -> TransportResult<Option<BoxedStream>> {
        loop {
            let (send, mut recv) = match self.inner.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(session_id = %self.session_id, "Session ended: {}", e);
                    return Ok(None);
                }
            };

            let mut preface = [0u8; 1];
            match recv.read_exact(&mut preface).await {
                Ok(_) if preface[0] == STREAM_PREFACE => {
                    trace!(
                        session_id = %self.session_id,
                        stream_id = send.id().index(),
                        "Accepted stream"
                    );
                    return Ok(Some(Box::new(QuicStream::new(send, recv))));
                }
                Ok(_) => {
                    return Err(TransportError::ProtocolError(format!(
                        "Unexpected stream preface {:#04x}",
                        preface[0]
                    )));
                }
                Err(e) => {
                    // Opener abandoned the stream before the preface arrived
                    debug!(session_id = %self.session_id, "Dropping stale stream: {}", e);
                }
            }
        }
    }

    async fn close(&self, reason: &str) {
        self.inner.close(quinn::VarInt::from_u32(0), reason.as_bytes());
        debug!(session_id = %self.session_id, reason, "QUIC connection closed");
    }

    async fn closed(&self) {
        let reason = self.inner.closed().await;
        trace!(session_id = %self.session_id, "QUIC connection ended: {}", reason);
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn protocol(&self) -> &'static str {
        "quic"
    }

    fn session_id(&self) -> String {
        self.session_id.clone()
    }
}

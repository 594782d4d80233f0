//! HTTP/2 stream as a byte stream

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// HTTP/2 stream wrapper
///
/// The two DATA directions of one HTTP/2 stream, exposed as
/// `AsyncRead + AsyncWrite`. Shutdown sends an empty frame with END_STREAM;
/// dropping the stream before both sides finished resets it.
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    stream_id: u32,
    /// Unread remainder of the last DATA frame
    pending: Bytes,
    recv_done: bool,
    send_done: bool,
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream")
            .field("stream_id", &self.stream_id)
            .field("recv_done", &self.recv_done)
            .field("send_done", &self.send_done)
            .finish()
    }
}

impl H2Stream {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        let stream_id = send.stream_id().as_u32();
        Self {
            send,
            recv,
            stream_id,
            pending: Bytes::new(),
            recv_done: false,
            send_done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

fn h2_to_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        if let Some(io_err) = err.into_io() {
            return io_err;
        }
        return io::Error::new(io::ErrorKind::BrokenPipe, "h2 io error");
    }
    io::Error::new(io::ErrorKind::Other, err)
}

/// A peer that finished its side and then resets with NO_ERROR or CANCEL has
/// nothing more to say; treat it as end of stream.
fn is_graceful_reset(err: &h2::Error) -> bool {
    matches!(err.reason(), Some(Reason::NO_ERROR) | Some(Reason::CANCEL)) && err.is_reset()
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.recv_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    // Release flow control capacity
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.pending = data;
                }
                Some(Err(e)) if is_graceful_reset(&e) => {
                    trace!(stream_id = this.stream_id, "H2 stream reset after completion");
                    this.recv_done = true;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => {
                    this.recv_done = true;
                }
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.send_done {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        this.send.reserve_capacity(buf.len());

        loop {
            match ready!(this.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(capacity)) => {
                    let n = capacity.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // DATA frames are queued on send_data; the connection task writes them
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.send_done {
            return Poll::Ready(Ok(()));
        }
        this.send_done = true;

        // Send empty data with END_STREAM flag
        match this.send.send_data(Bytes::new(), true) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_graceful_reset(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(h2_to_io(e))),
        }
    }
}

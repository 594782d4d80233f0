//! Public HTTP listener feeding the router

use backhaul_proto::{strip_hop_by_hop, REQUEST_ID_HEADER};
use http::header::HeaderValue;
use http::{Request, Response};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::server::{fallback_response, request_host, request_id, RelayBody, TunnelServer};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Response body that cancels its request's stream when dropped
pub struct GuardedBody<B> {
    inner: B,
    _guard: DropGuard,
}

impl<B> GuardedBody<B> {
    fn new(inner: B, guard: DropGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl TunnelServer {
    /// Serve public HTTP/1.1 and HTTP/2 traffic until the server is closed
    pub async fn serve_http(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("HTTP front end listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown_token().cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle_inbound(req, peer).await) }
                });

                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, "HTTP connection ended: {}", e);
                }
            });
        }

        Ok(())
    }

    async fn handle_inbound(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<GuardedBody<RelayBody>> {
        let headers = req.headers_mut();
        if !headers.contains_key(REQUEST_ID_HEADER) {
            if let Ok(id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
                headers.insert(REQUEST_ID_HEADER, id);
            }
        }
        if let Ok(ip) = HeaderValue::from_str(&peer.ip().to_string()) {
            headers.append(X_FORWARDED_FOR, ip);
        }
        strip_hop_by_hop(headers);

        let host = request_host(&req);
        let id = request_id(&req);

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        req.extensions_mut().insert(cancel);

        let response = match self.round_trip(req).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(RelayError::Cancelled) => {
                debug!(request_id = %id, "Request cancelled");
                fallback_response(&host, &id)
            }
            Err(e) => {
                warn!(host = %host, request_id = %id, "Request failed: {}", e);
                fallback_response(&host, &id)
            }
        };

        response.map(|body| GuardedBody::new(body, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        use http_body_util::{BodyExt, Empty};

        let token = CancellationToken::new();
        let body = GuardedBody::new(Empty::<Bytes>::new(), token.clone().drop_guard());
        assert!(!token.is_cancelled());

        let collected = body.collect().await.unwrap();
        assert!(collected.to_bytes().is_empty());
        assert!(token.is_cancelled());
    }
}

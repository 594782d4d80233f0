//! Tunnel client: dial the relay, authenticate, serve its streams

use backhaul_proto::{write_auth, Auth};
use backhaul_transport::{BoxedStream, SharedSession};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::proxy::HttpProxy;

/// One backend registration with a relay
///
/// The client does not reconnect; callers that want resilience call
/// [`connect`](Self::connect) again.
#[derive(Debug)]
pub struct TunnelClient {
    config: ClientConfig,
    proxy: Arc<HttpProxy>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let proxy = Arc::new(HttpProxy::new(&config.backend_url)?);
        Ok(Self { config, proxy })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dial the configured relay and serve until cancelled or disconnected
    ///
    /// Returns `Ok(())` when `cancel` fires and [`ClientError::Disconnected`]
    /// when the relay ends the session.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let connector = self.config.connector()?;
        let addr = self.config.resolve().await?;
        let server_name = self.config.server_name();

        debug!(
            relay = %addr,
            transport = ?self.config.transport,
            "Dialing relay"
        );

        let session = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            session = connector.connect(addr, &server_name) => session?,
        };

        self.serve(session, cancel).await
    }

    /// Run the handshake and serve streams on an already dialed session
    pub async fn serve(
        &self,
        session: SharedSession,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let result = self.serve_session(&session, &cancel).await;
        session.close("client shutting down").await;
        result
    }

    async fn serve_session(
        &self,
        session: &SharedSession,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        // The relay opens the control stream
        let mut control = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = session.accept_stream() => accepted?.ok_or(ClientError::Disconnected)?,
        };

        let auth = Auth::new(self.config.token.clone(), self.config.domain.clone());
        write_auth(&mut control, &auth).await?;

        info!(
            domain = %self.config.domain,
            relay = %session.remote_address(),
            proto = session.protocol(),
            backend = %self.proxy.target(),
            "Connected to relay"
        );

        let streams = cancel.child_token();
        let _streams_guard = streams.clone().drop_guard();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(domain = %self.config.domain, "Disconnecting from relay");
                    return Ok(());
                }
                accepted = session.accept_stream() => accepted?,
            };

            let Some(stream) = accepted else {
                info!(domain = %self.config.domain, "Relay closed the session");
                return Err(ClientError::Disconnected);
            };

            let proxy = self.proxy.clone();
            let streams = streams.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = streams.cancelled() => trace!("Stream abandoned on shutdown"),
                    _ = serve_stream(stream, proxy) => {}
                }
            });
        }
    }
}

/// Serve exactly one HTTP exchange on a relay-opened stream
async fn serve_stream(stream: BoxedStream, proxy: Arc<HttpProxy>) {
    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.forward(req).await) }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        trace!("Stream ended: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use backhaul_proto::read_auth;
    use backhaul_transport::{MemorySession, MuxSession};
    use std::time::Duration;

    fn client() -> TunnelClient {
        TunnelClient::new(ClientConfig::new(
            TransportKind::Tcp,
            "127.0.0.1:4443",
            "orcaz r kewl",
            "cetacean.club",
            "http://127.0.0.1:1",
        ))
        .unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let config = ClientConfig::new(TransportKind::Tcp, "127.0.0.1:4443", "", "d", "http://x");
        assert!(matches!(TunnelClient::new(config), Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_writes_auth_on_control_stream() {
        let (relay, backend) = MemorySession::pair();
        let cancel = CancellationToken::new();

        let client = client();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.serve(backend, cancel).await }
        });

        let mut control = relay.open_stream().await.unwrap();
        let auth = read_auth(&mut control).await.unwrap();
        assert_eq!(auth, Auth::new("orcaz r kewl", "cetacean.club"));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relay_close_is_disconnect() {
        let (relay, backend) = MemorySession::pair();
        let client = client();
        let task = tokio::spawn(async move { client.serve(backend, CancellationToken::new()).await });

        let mut control = relay.open_stream().await.unwrap();
        read_auth(&mut control).await.unwrap();
        relay.close("rejected").await;

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_answers_502() {
        use bytes::Bytes;
        use http_body_util::{BodyExt, Empty};

        let (relay, backend) = MemorySession::pair();
        let cancel = CancellationToken::new();
        let client = client();
        let _task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.serve(backend, cancel).await }
        });

        let mut control = relay.open_stream().await.unwrap();
        read_auth(&mut control).await.unwrap();

        let stream = relay.open_stream().await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let req = http::Request::get("/")
            .header(http::header::HOST, "cetacean.club")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(req).await.unwrap();
        assert_eq!(response.status(), 502);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("bad gateway"));
        cancel.cancel();
    }
}

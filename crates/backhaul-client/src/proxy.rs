//! HTTP reverse proxy to the local backend
//!
//! Keeps a small pool of HTTP/1.1 connections to the backend and forwards
//! each request arriving from the relay over one of them.

use bytes::Bytes;
use backhaul_proto::strip_hop_by_hop;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, ProxyError};

/// Maximum number of pooled connections to the backend
const MAX_POOL_SIZE: usize = 10;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub struct HttpProxy {
    /// Backend `host:port`
    target: String,
    /// Path prefix of the backend URL, without trailing slash
    base_path: String,
    pool: Mutex<Vec<http1::SendRequest<Incoming>>>,
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("target", &self.target)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl HttpProxy {
    pub fn new(backend_url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(backend_url)
            .map_err(|e| ClientError::Config(format!("invalid backend URL: {}", e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Config("backend URL has no host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        // Url keeps brackets around IPv6 hosts, which is what connect() wants
        let target = format!("{}:{}", host, port);

        Ok(Self {
            target,
            base_path: url.path().trim_end_matches('/').to_string(),
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward one request; an unreachable backend becomes a 502
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.try_forward(req).await {
            Ok(response) => {
                debug!(%method, %path, status = %response.status(), "Proxied request");
                response
            }
            Err(e) => {
                warn!(%method, %path, "Backend unreachable: {}", e);
                bad_gateway(&e)
            }
        }
    }

    async fn try_forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        strip_hop_by_hop(req.headers_mut());

        let path = req
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let upstream: Uri = format!("{}{}", self.base_path, path).parse()?;
        *req.uri_mut() = upstream;

        if !req.headers().contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&self.target) {
                req.headers_mut().insert(header::HOST, host);
            }
        }

        let mut sender = self.get_connection().await?;
        let response = sender.send_request(req).await.map_err(ProxyError::Request)?;
        self.return_connection(sender).await;

        let mut response = response.map(|body| body.boxed());
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }

    async fn get_connection(&self) -> Result<http1::SendRequest<Incoming>, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(sender);
                }
            }
        }

        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target)
            .await
            .map_err(|source| ProxyError::Connect {
                target: self.target.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Incoming>) {
        if sender.is_closed() {
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }
}

fn bad_gateway(error: &ProxyError) -> Response<ProxyBody> {
    let body = format!("bad gateway: {}\n", error);
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

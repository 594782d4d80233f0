//! HTTP/2 sessions over loopback TCP, plain and TLS

use backhaul_transport::{SharedSession, TransportConnector, TransportListener};
use backhaul_transport_h2::{H2Config, H2Connector, H2Listener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn session_pair(
    relay_config: H2Config,
    backend_config: H2Config,
) -> (SharedSession, SharedSession) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = H2Listener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(relay_config))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = tokio::spawn(async move {
        let handshake = listener.accept().await.unwrap();
        handshake.establish().await.unwrap()
    });

    let connector = H2Connector::new(Arc::new(backend_config)).unwrap();
    let backend = connector.connect(addr, "localhost").await.unwrap();
    let relay = relay.await.unwrap();

    (relay, backend)
}

async fn exchange(relay: &SharedSession, backend: &SharedSession) {
    let (opened, accepted) = tokio::join!(relay.open_stream(), backend.accept_stream());
    let mut opened = opened.unwrap();
    let mut accepted = accepted.unwrap().unwrap();

    opened.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
    opened.shutdown().await.unwrap();

    let mut request = Vec::new();
    accepted.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"GET /health HTTP/1.1\r\n\r\n");

    accepted.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    accepted.shutdown().await.unwrap();

    let mut response = Vec::new();
    opened.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_session_streams() {
    let (relay, backend) = session_pair(H2Config::plain(), H2Config::plain()).await;

    assert_eq!(relay.protocol(), "tcp");
    assert_eq!(backend.protocol(), "tcp");

    // Several sequential streams on one session
    for _ in 0..3 {
        exchange(&relay, &backend).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_payload_respects_flow_control() {
    let (relay, backend) = session_pair(H2Config::plain(), H2Config::plain()).await;

    let (opened, accepted) = tokio::join!(relay.open_stream(), backend.accept_stream());
    let mut opened = opened.unwrap();
    let mut accepted = accepted.unwrap().unwrap();

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        opened.write_all(&payload).await.unwrap();
        opened.shutdown().await.unwrap();
        opened
    });

    let mut received = Vec::new();
    accepted.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);

    writer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_close_ends_backend_session() {
    let (relay, backend) = session_pair(H2Config::plain(), H2Config::plain()).await;

    relay.close("test").await;

    tokio::time::timeout(Duration::from_secs(5), backend.closed())
        .await
        .expect("backend should observe the closed connection");
    assert!(backend.accept_stream().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_backend_drop_ends_relay_session() {
    let (relay, backend) = session_pair(H2Config::plain(), H2Config::plain()).await;

    drop(backend);

    tokio::time::timeout(Duration::from_secs(5), relay.closed())
        .await
        .expect("relay should observe the closed connection");
    assert!(relay.open_stream().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_session_streams() {
    let cert = backhaul_cert::generate_self_signed_cert().unwrap();

    let relay_config = H2Config::server_tls_der(cert.cert_der.clone(), cert.key_der.clone());
    let backend_config = H2Config::client_tls().with_root_certificate(cert.cert_der.clone());

    let (relay, backend) = session_pair(relay_config, backend_config).await;
    assert_eq!(relay.protocol(), "tls");

    exchange(&relay, &backend).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_rejects_unknown_certificate() {
    let cert = backhaul_cert::generate_self_signed_cert().unwrap();
    let relay_config = Arc::new(H2Config::server_tls_der(cert.cert_der, cert.key_der));

    let listener = H2Listener::bind("127.0.0.1:0".parse().unwrap(), relay_config)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = tokio::spawn(async move {
        let handshake = listener.accept().await.unwrap();
        handshake.establish().await
    });

    // Verifies against webpki roots, which do not include the self-signed cert
    let connector = H2Connector::new(Arc::new(H2Config::client_tls())).unwrap();
    assert!(connector.connect(addr, "localhost").await.is_err());
    assert!(relay.await.unwrap().is_err());
}

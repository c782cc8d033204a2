//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use nsmgr::config::{Endpoint, ManagerConfig, RegistryConfig, ShutdownConfig};
use nsmgr::identity::{IdentitySource, StaticIdentityProvider};
use nsmgr::net::StaticInterfaces;
use nsmgr::{Collaborators, ProcessContext};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const ID: &str = "spiffe://example.org/ns/default/nsmgr";
pub const SVID_PEM: &[u8] = include_bytes!("../fixtures/svid.pem");
pub const SVID_KEY: &[u8] = include_bytes!("../fixtures/svid.key");
pub const BUNDLE_PEM: &[u8] = include_bytes!("../fixtures/bundle.pem");

/// Address reported by the fake interface list.
pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

pub fn fixture_provider() -> StaticIdentityProvider {
    StaticIdentityProvider::from_pem(SVID_PEM, SVID_KEY, BUNDLE_PEM)
}

/// A second identity source, acting as the peer in TLS tests.
pub async fn peer_identity() -> IdentitySource {
    IdentitySource::bootstrap(
        &ProcessContext::new(),
        Arc::new(fixture_provider()),
        &Default::default(),
    )
    .await
    .unwrap()
}

pub fn collaborators() -> Collaborators {
    let mut collaborators = Collaborators::with_identity(Arc::new(fixture_provider()));
    collaborators.interfaces = Arc::new(StaticInterfaces(vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(HOST_IP),
    ]));
    collaborators
}

pub fn config(listen_on: Vec<Endpoint>, registry_url: Option<Endpoint>) -> ManagerConfig {
    ManagerConfig {
        name: "nsmgr-test".into(),
        listen_on,
        registry_url,
        registry: RegistryConfig {
            dial_timeout_secs: 1,
            ..RegistryConfig::default()
        },
        shutdown: ShutdownConfig {
            drain_timeout_secs: 1,
        },
        ..ManagerConfig::default()
    }
}

/// A TCP port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn unix_socket(dir: &Path) -> Endpoint {
    Endpoint::unix(dir.join("run/nsm/listen.sock"))
}

/// Open an mTLS connection as `peer`.
pub async fn tls_connect(peer: &IdentitySource, port: u16) -> TlsStream<TcpStream> {
    let config = nsmgr::identity::mtls_client_config(peer).unwrap();
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    TlsConnector::from(config)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap()
}

/// Minimal HTTP/1.1 GET returning the status code and body.
pub async fn http_get<S>(mut stream: S, path: &str) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET {path} HTTP/1.1\r\nHost: nsmgr\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    // TLS peers may close without close_notify; keep whatever arrived.
    let _ = stream.read_to_end(&mut raw).await;
    let response = String::from_utf8_lossy(&raw).into_owned();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

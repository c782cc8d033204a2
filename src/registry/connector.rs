//! Outbound connection to the registry.
//!
//! # Responsibilities
//! - Treat a missing registry address as standalone mode
//! - Dial the registry over mTLS within a bounded timeout
//! - Retry transient failures inside that bound (wait-for-ready)

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio_rustls::TlsConnector;
use tracing::Instrument;

use crate::config::{Endpoint, RegistryConfig};
use crate::lifecycle::ProcessContext;
use crate::resilience::Backoff;

/// Errors raised while connecting to the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Byte stream to the registry.
pub trait RegistryIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RegistryIo for T {}

/// An established channel to the registry.
pub struct RegistryConnection {
    target: Endpoint,
    io: Mutex<Box<dyn RegistryIo>>,
}

impl RegistryConnection {
    pub fn new(target: Endpoint, io: impl RegistryIo + 'static) -> Self {
        Self {
            target,
            io: Mutex::new(Box::new(io)),
        }
    }

    /// Address this connection was dialed to.
    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Exclusive access to the underlying stream.
    pub async fn io(&self) -> MutexGuard<'_, Box<dyn RegistryIo>> {
        self.io.lock().await
    }
}

impl fmt::Debug for RegistryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConnection")
            .field("target", &self.target.to_string())
            .finish_non_exhaustive()
    }
}

/// Opens transport connections to a registry address.
#[async_trait]
pub trait RegistryDialer: Send + Sync + 'static {
    async fn dial(
        &self,
        target: &Endpoint,
        tls: Arc<ClientConfig>,
    ) -> Result<RegistryConnection, RegistryError>;
}

/// Dials TCP or unix sockets and runs the mTLS handshake.
#[derive(Debug, Clone)]
pub struct TlsRegistryDialer {
    wait_for_ready: bool,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl TlsRegistryDialer {
    pub fn new(wait_for_ready: bool, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            wait_for_ready,
            backoff_base,
            backoff_max,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(
            true,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    async fn attempt(
        &self,
        target: &Endpoint,
        connector: &TlsConnector,
    ) -> Result<RegistryConnection, RegistryError> {
        let address = target.to_string();
        match target {
            Endpoint::Tcp { .. } => {
                let Some((host, port)) = target.socket_host() else {
                    return Err(RegistryError::Connect {
                        address,
                        source: io::Error::new(io::ErrorKind::InvalidInput, "missing host"),
                    });
                };
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|source| RegistryError::Connect {
                        address: address.clone(),
                        source,
                    })?;
                let name = server_name(&host).map_err(|source| RegistryError::Handshake {
                    address: address.clone(),
                    source,
                })?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|source| RegistryError::Handshake { address, source })?;
                Ok(RegistryConnection::new(target.clone(), tls))
            }
            Endpoint::Unix { path } => {
                let stream =
                    UnixStream::connect(path)
                        .await
                        .map_err(|source| RegistryError::Connect {
                            address: address.clone(),
                            source,
                        })?;
                let name = server_name("localhost").map_err(|source| {
                    RegistryError::Handshake {
                        address: address.clone(),
                        source,
                    }
                })?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|source| RegistryError::Handshake { address, source })?;
                Ok(RegistryConnection::new(target.clone(), tls))
            }
        }
    }
}

#[async_trait]
impl RegistryDialer for TlsRegistryDialer {
    async fn dial(
        &self,
        target: &Endpoint,
        tls: Arc<ClientConfig>,
    ) -> Result<RegistryConnection, RegistryError> {
        let connector = TlsConnector::from(tls);
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);

        loop {
            match self.attempt(target, &connector).await {
                Ok(connection) => return Ok(connection),
                Err(e) if self.wait_for_ready => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        error = %e,
                        attempt = backoff.attempts(),
                        delay = ?delay,
                        "Registry not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>, io::Error> {
    ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Connect to the registry, or return `None` when no address is configured.
///
/// Any dial failure within `timeout`, including the timeout itself, is
/// reported as [`RegistryError::Unreachable`].
pub async fn connect_registry(
    ctx: &ProcessContext,
    address: Option<&Endpoint>,
    dialer: &dyn RegistryDialer,
    tls: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<Option<RegistryConnection>, RegistryError> {
    let Some(target) = address else {
        tracing::info!("No registry configured, running standalone");
        return Ok(None);
    };

    let span = tracing::info_span!("dial_registry", registry = %target);
    async move {
        tracing::info!(timeout = ?timeout, "Connecting to registry");
        let unreachable = |reason: String| RegistryError::Unreachable {
            address: target.to_string(),
            reason,
        };

        let dialed = tokio::select! {
            _ = ctx.cancelled() => Err(unreachable("cancelled".into())),
            dialed = tokio::time::timeout(timeout, dialer.dial(target, tls)) => match dialed {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(e)) => Err(unreachable(e.to_string())),
                Err(_) => Err(unreachable(format!("no connection within {timeout:?}"))),
            },
        };

        match dialed {
            Ok(connection) => {
                tracing::info!("Connected to registry");
                Ok(Some(connection))
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to dial registry");
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistryDialer for CountingDialer {
        async fn dial(
            &self,
            target: &Endpoint,
            _tls: Arc<ClientConfig>,
        ) -> Result<RegistryConnection, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (io, _peer) = tokio::io::duplex(64);
            Ok(RegistryConnection::new(target.clone(), io))
        }
    }

    struct NeverReady;

    #[async_trait]
    impl RegistryDialer for NeverReady {
        async fn dial(
            &self,
            _target: &Endpoint,
            _tls: Arc<ClientConfig>,
        ) -> Result<RegistryConnection, RegistryError> {
            std::future::pending().await
        }
    }

    fn client_config() -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder_with_provider(crate::identity::tls::crypto_provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    #[tokio::test]
    async fn no_address_means_standalone() {
        let dialer = CountingDialer {
            calls: AtomicUsize::new(0),
        };
        let connection = connect_registry(
            &ProcessContext::new(),
            None,
            &dialer,
            client_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(connection.is_none());
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn returns_dialed_connection() {
        let dialer = CountingDialer {
            calls: AtomicUsize::new(0),
        };
        let target = Endpoint::tcp("registry", 5002);
        let connection = connect_registry(
            &ProcessContext::new(),
            Some(&target),
            &dialer,
            client_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(connection.target(), &target);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_dial_is_bounded_by_timeout() {
        let target = Endpoint::tcp("registry", 5002);
        let err = connect_registry(
            &ProcessContext::new(),
            Some(&target),
            &NeverReady,
            client_config(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RegistryError::Unreachable { .. }));
    }

    #[test]
    fn ip_hosts_become_ip_server_names() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("registry.nsm-system").unwrap(),
            ServerName::DnsName(_)
        ));
    }
}

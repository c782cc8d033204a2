//! Listener set: one serve loop per configured endpoint.
//!
//! # Responsibilities
//! - Bind every endpoint and return only once all of them are bound
//! - Fail fast when any endpoint cannot bind
//! - Turn the first post-startup serving failure into process shutdown
//! - Drain connections on shutdown, then abort whatever is left
//!
//! # Design Decisions
//! - TCP endpoints serve over mTLS when a server config is supplied; unix
//!   sockets are plaintext (filesystem permissions guard them)
//! - Stale unix sockets are removed before bind; live ones are refused

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::future::try_join_all;
use rustls::ServerConfig;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Endpoint;
use crate::lifecycle::{ProcessContext, ShutdownCause};
use crate::observability::metrics;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("no listen endpoints configured")]
    NoEndpoints,
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("{path} exists and is not a socket")]
    NotSocket { path: String },
    #[error("{path} is in use by another listener")]
    InUse { path: String },
    #[error("listener {endpoint} failed: {source}")]
    Serve {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("listener {endpoint} stopped serving unexpectedly")]
    Stopped { endpoint: String },
    #[error("serve loop for {endpoint} exited without reporting")]
    Aborted { endpoint: String },
}

impl ListenerError {
    /// Endpoint or path the error refers to.
    pub fn endpoint(&self) -> String {
        match self {
            Self::NoEndpoints => String::new(),
            Self::Bind { endpoint, .. }
            | Self::Serve { endpoint, .. }
            | Self::Stopped { endpoint }
            | Self::Aborted { endpoint } => endpoint.clone(),
            Self::NotSocket { path } | Self::InUse { path } => path.clone(),
        }
    }
}

/// An endpoint that finished binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEndpoint {
    pub endpoint: Endpoint,
    /// Socket address actually bound, for TCP endpoints.
    pub local_addr: Option<SocketAddr>,
}

impl BoundEndpoint {
    /// URL of the bound socket, with the kernel-assigned port filled in.
    pub fn url(&self) -> String {
        match (&self.endpoint, self.local_addr) {
            (Endpoint::Tcp { host, .. }, Some(addr)) => {
                Endpoint::tcp(host.clone(), addr.port()).to_string()
            }
            (endpoint, _) => endpoint.to_string(),
        }
    }
}

/// Running serve loops and their failure watchers.
pub struct ListenerSet {
    bound: Vec<BoundEndpoint>,
    token: CancellationToken,
    loops: JoinSet<()>,
    supervisors: JoinSet<()>,
    drain: Duration,
}

impl ListenerSet {
    /// Start one serve loop per endpoint and wait until all of them are bound.
    ///
    /// When an endpoint fails to bind, the loops already started are shut
    /// down and the bind error is returned. The process context is left alone;
    /// deciding whether that is fatal belongs to the caller.
    pub async fn start(
        ctx: &ProcessContext,
        endpoints: &[Endpoint],
        router: Router,
        tls: Option<Arc<ServerConfig>>,
        drain: Duration,
    ) -> Result<Self, ListenerError> {
        if endpoints.is_empty() {
            return Err(ListenerError::NoEndpoints);
        }

        let token = ctx.child_token();
        let tls = tls.map(RustlsConfig::from_config);
        let mut set = Self {
            bound: Vec::with_capacity(endpoints.len()),
            token: token.clone(),
            loops: JoinSet::new(),
            supervisors: JoinSet::new(),
            drain,
        };

        let mut ready = Vec::with_capacity(endpoints.len());
        let mut failures = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let (ready_tx, ready_rx) = oneshot::channel();
            let (failed_tx, failed_rx) = oneshot::channel();
            let serve_loop = ServeLoop {
                endpoint: endpoint.clone(),
                router: router.clone(),
                tls: if endpoint.is_tcp() { tls.clone() } else { None },
                token: token.clone(),
                drain,
            };
            set.loops.spawn(
                serve_loop
                    .run(ready_tx, failed_tx)
                    .instrument(tracing::info_span!("listener", endpoint = %endpoint)),
            );

            let aborted = ListenerError::Aborted {
                endpoint: endpoint.to_string(),
            };
            ready.push(async move { ready_rx.await.unwrap_or(Err(aborted)) });
            failures.push(failed_rx);
        }

        match try_join_all(ready).await {
            Ok(bound) => set.bound = bound,
            Err(e) => {
                tracing::error!(error = %e, "Listener failed to bind");
                set.shutdown().await;
                return Err(e);
            }
        }

        for (failed, bound) in failures.into_iter().zip(&set.bound) {
            let endpoint = bound.endpoint.to_string();
            let span = tracing::info_span!("listener_watch", endpoint = %endpoint);
            set.supervisors
                .spawn(supervise(ctx.clone(), token.clone(), endpoint, failed).instrument(span));
        }
        tracing::info!(listeners = set.bound.len(), "All listeners bound");
        Ok(set)
    }

    /// Abort every serve loop as if it had crashed.
    #[cfg(test)]
    pub(crate) fn abort_loops(&mut self) {
        self.loops.abort_all();
    }

    /// Endpoints bound by this set, in configuration order.
    pub fn bound(&self) -> &[BoundEndpoint] {
        &self.bound
    }

    /// Stop accepting, drain for up to the drain timeout, then abort the rest.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.token.cancel();

        let drained = tokio::time::timeout(self.drain, async {
            while let Some(joined) = self.loops.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Serve loop panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(drain = ?self.drain, "Drain timeout elapsed, aborting remaining connections");
            self.loops.abort_all();
            while self.loops.join_next().await.is_some() {}
        }

        self.supervisors.abort_all();
        while self.supervisors.join_next().await.is_some() {}

        for path in self.bound.iter().filter_map(|b| b.endpoint.path()) {
            remove_socket(path);
        }
    }
}

/// Cancel the process context when the watched loop fails.
///
/// A loop that vanishes without reporting while its token is live panicked or
/// was aborted, and counts as a failure too.
async fn supervise(
    ctx: ProcessContext,
    token: CancellationToken,
    endpoint: String,
    failed: oneshot::Receiver<ListenerError>,
) {
    let failure = tokio::select! {
        _ = token.cancelled() => return,
        failure = failed => match failure {
            Ok(e) => e,
            Err(_) if token.is_cancelled() => return,
            Err(_) => ListenerError::Aborted { endpoint },
        },
    };

    tracing::error!(error = %failure, "Listener failed, shutting down");
    ctx.cancel(ShutdownCause::ListenerFailed {
        endpoint: failure.endpoint(),
        error: failure.to_string(),
    });
}

type Ready = oneshot::Sender<Result<BoundEndpoint, ListenerError>>;

struct ServeLoop {
    endpoint: Endpoint,
    router: Router,
    tls: Option<RustlsConfig>,
    token: CancellationToken,
    drain: Duration,
}

impl ServeLoop {
    async fn run(self, ready: Ready, failed: oneshot::Sender<ListenerError>) {
        let outcome = match &self.endpoint {
            Endpoint::Unix { path } => self.serve_unix(path, ready).await,
            Endpoint::Tcp { .. } => self.serve_tcp(ready).await,
        };
        // Bind failures were already reported through `ready`.
        let Some(result) = outcome else { return };

        let endpoint = self.endpoint.to_string();
        let failure = match result {
            Err(source) => ListenerError::Serve { endpoint, source },
            Ok(()) if !self.token.is_cancelled() => ListenerError::Stopped { endpoint },
            Ok(()) => {
                tracing::debug!("Listener stopped");
                return;
            }
        };

        if self.token.is_cancelled() {
            tracing::warn!(error = %failure, "Listener failed during shutdown");
        }
        let _ = failed.send(failure);
    }

    async fn serve_unix(&self, path: &Path, ready: Ready) -> Option<io::Result<()>> {
        let listener = match bind_unix(path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready.send(Err(e));
                return None;
            }
        };

        tracing::info!(path = %path.display(), "Listening");
        let _ = ready.send(Ok(BoundEndpoint {
            endpoint: self.endpoint.clone(),
            local_addr: None,
        }));
        metrics::listener_bound();

        let result = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(self.token.clone().cancelled_owned())
            .await;

        metrics::listener_closed();
        remove_socket(path);
        Some(result)
    }

    async fn serve_tcp(&self, ready: Ready) -> Option<io::Result<()>> {
        let listener = match bind_tcp(&self.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready.send(Err(e));
                return None;
            }
        };

        let local_addr = listener.local_addr().ok();
        tracing::info!(address = ?local_addr, tls = self.tls.is_some(), "Listening");
        let _ = ready.send(Ok(BoundEndpoint {
            endpoint: self.endpoint.clone(),
            local_addr,
        }));
        metrics::listener_bound();

        let handle = Handle::new();
        let app = self.router.clone().into_make_service();
        let serve = async {
            match &self.tls {
                Some(tls) => {
                    axum_server::from_tcp_rustls(listener, tls.clone())
                        .handle(handle.clone())
                        .serve(app)
                        .await
                }
                None => {
                    axum_server::from_tcp(listener)
                        .handle(handle.clone())
                        .serve(app)
                        .await
                }
            }
        };
        tokio::pin!(serve);

        let result = tokio::select! {
            result = &mut serve => result,
            _ = self.token.cancelled() => {
                handle.graceful_shutdown(Some(self.drain));
                serve.await
            }
        };

        metrics::listener_closed();
        Some(result)
    }
}

async fn bind_tcp(endpoint: &Endpoint) -> Result<std::net::TcpListener, ListenerError> {
    let bind_error = |source: io::Error| ListenerError::Bind {
        endpoint: endpoint.to_string(),
        source,
    };
    let (host, port) = endpoint.socket_host().ok_or_else(|| {
        bind_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a TCP endpoint",
        ))
    })?;

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .map_err(bind_error)?;
    // axum-server takes a std listener; into_std keeps it non-blocking.
    listener.into_std().map_err(bind_error)
}

fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    let bind_error = |source: io::Error| ListenerError::Bind {
        endpoint: Endpoint::unix(path).to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(bind_error)?;
    }

    if let Ok(metadata) = fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::NotSocket {
                path: path.display().to_string(),
            });
        }
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::InUse {
                    path: path.display().to_string(),
                });
            }
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionRefused
                    || e.kind() == io::ErrorKind::NotFound =>
            {
                tracing::debug!(path = %path.display(), "Removing stale socket");
                fs::remove_file(path).map_err(bind_error)?;
            }
            Err(e) => return Err(bind_error(e)),
        }
    }

    UnixListener::bind(path).map_err(bind_error)
}

fn remove_socket(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket"),
    }
}

//! Lifecycle controller.
//!
//! # Responsibilities
//! - Run the startup sequence and surface fatal startup errors synchronously
//! - Block until the process context is cancelled
//! - Run the shutdown sequence exactly once, however many callers ask for it
//!
//! # Startup order
//! ```text
//! identity bootstrap → registry dial → public URL → chain → listeners
//! ```
//! A failure at any step releases what earlier steps acquired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::chain::{
    assemble_chain, AllowAll, Authorizer, ChainBuilder, ChainError, LocalChainBuilder,
    ManagerRecord,
};
use crate::config::ManagerConfig;
use crate::identity::{
    mtls_client_config, mtls_server_config, FileIdentityProvider, IdentityProvider,
    IdentitySource, ProvisionError, TlsError,
};
use crate::lifecycle::{ProcessContext, ShutdownCause};
use crate::net::{
    resolve_public_url, BoundEndpoint, InterfaceAddrs, ListenerError, ListenerSet,
    SystemInterfaces,
};
use crate::observability::metrics;
use crate::registry::{
    connect_registry, RegistryConnection, RegistryDialer, RegistryError, TlsRegistryDialer,
};

/// Fatal startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(#[source] ProvisionError),
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(#[source] RegistryError),
    #[error("listener failed to bind: {0}")]
    ListenerBindFailure(#[source] ListenerError),
    #[error("failed to construct processing chain: {0}")]
    ChainConstruction(#[source] ChainError),
    #[error("failed to build transport credentials: {0}")]
    Credentials(#[source] TlsError),
}

/// External collaborators the manager wires together.
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub dialer: Arc<dyn RegistryDialer>,
    pub chain: Arc<dyn ChainBuilder>,
    pub authorizer: Arc<dyn Authorizer>,
    pub interfaces: Arc<dyn InterfaceAddrs>,
    /// Serve TCP endpoints over mTLS. When false they are served in plaintext.
    pub tls: bool,
}

impl Collaborators {
    /// Production collaborators: file-based identity, TLS registry dialer,
    /// local chain, allow-all policy, OS interfaces.
    pub fn from_config(config: &ManagerConfig) -> Result<Self, ManagerError> {
        let provider = FileIdentityProvider::from_config(&config.identity)
            .map_err(ManagerError::IdentityUnavailable)?;
        let mut collaborators = Self::with_identity(Arc::new(provider));
        collaborators.dialer = Arc::new(TlsRegistryDialer::from_config(&config.registry));
        Ok(collaborators)
    }

    /// Default collaborators around the given identity provider.
    pub fn with_identity(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            dialer: Arc::new(TlsRegistryDialer::from_config(&Default::default())),
            chain: Arc::new(LocalChainBuilder),
            authorizer: Arc::new(AllowAll),
            interfaces: Arc::new(SystemInterfaces),
            tls: true,
        }
    }
}

/// Where the manager is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Stopped,
}

/// A started manager.
pub struct Manager {
    ctx: ProcessContext,
    config: Arc<ManagerConfig>,
    identity: IdentitySource,
    registry: Option<Arc<RegistryConnection>>,
    public_url: String,
    bound: Vec<BoundEndpoint>,
    listeners: Mutex<Option<ListenerSet>>,
    stopped: AtomicBool,
}

impl Manager {
    /// Run the startup sequence. Returns once every listener is bound.
    pub async fn start(
        ctx: ProcessContext,
        config: Arc<ManagerConfig>,
        collaborators: Collaborators,
    ) -> Result<Self, ManagerError> {
        let span = tracing::info_span!("manager", name = %config.name);
        Self::start_inner(ctx, config, collaborators)
            .instrument(span)
            .await
    }

    async fn start_inner(
        ctx: ProcessContext,
        config: Arc<ManagerConfig>,
        collaborators: Collaborators,
    ) -> Result<Self, ManagerError> {
        let started = Instant::now();
        let Collaborators {
            identity: provider,
            dialer,
            chain,
            authorizer,
            interfaces,
            tls,
        } = collaborators;

        let identity = IdentitySource::bootstrap(&ctx, provider, &config.identity)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to obtain X.509 SVID");
                ManagerError::IdentityUnavailable(e)
            })?;

        let serving = async {
            let client_tls = mtls_client_config(&identity).map_err(ManagerError::Credentials)?;
            let registry = connect_registry(
                &ctx,
                config.registry_url.as_ref(),
                dialer.as_ref(),
                client_tls,
                config.registry.dial_timeout(),
            )
            .await
            .map_err(ManagerError::RegistryUnreachable)?
            .map(Arc::new);

            let public_url = resolve_public_url(&config.listen_on, interfaces.as_ref())
                .ok_or(ManagerError::ListenerBindFailure(ListenerError::NoEndpoints))?;
            tracing::info!(url = %public_url, "Resolved public URL");

            let record = ManagerRecord {
                name: config.name.clone(),
                url: public_url.clone(),
            };
            let processing = assemble_chain(
                &ctx,
                record,
                &identity,
                authorizer,
                registry.clone(),
                config.max_token_lifetime(),
                chain.as_ref(),
            )
            .map_err(ManagerError::ChainConstruction)?;
            let router = processing.register(Router::new());

            let server_tls = if tls {
                Some(mtls_server_config(&identity).map_err(ManagerError::Credentials)?)
            } else {
                None
            };
            let listeners = ListenerSet::start(
                &ctx,
                &config.listen_on,
                router,
                server_tls,
                config.shutdown.drain_timeout(),
            )
            .await
            .map_err(ManagerError::ListenerBindFailure)?;

            Ok::<_, ManagerError>((registry, public_url, listeners))
        };

        let (registry, public_url, listeners) = match serving.await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(error = %e, "Startup failed");
                identity.close();
                return Err(e);
            }
        };

        metrics::record_startup(started.elapsed());
        tracing::info!(
            url = %public_url,
            listeners = listeners.bound().len(),
            elapsed = ?started.elapsed(),
            "Startup completed"
        );

        Ok(Self {
            bound: listeners.bound().to_vec(),
            ctx,
            config,
            identity,
            registry,
            public_url,
            listeners: Mutex::new(Some(listeners)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Block until the process context is cancelled and report why.
    pub async fn wait(&self) -> ShutdownCause {
        self.ctx.cancelled().await;
        self.ctx.cause().unwrap_or(ShutdownCause::Parent)
    }

    /// Cancel the context, stop serving, and release the identity source.
    ///
    /// Idempotent: concurrent callers wait for the first one to finish.
    pub async fn stop(&self) {
        self.ctx.cancel(ShutdownCause::Stopped);

        let mut listeners = self.listeners.lock().await;
        let Some(mut set) = listeners.take() else {
            return;
        };

        tracing::info!(name = %self.config.name, "Stopping listeners");
        set.shutdown().await;
        self.identity.close();
        self.stopped.store(true, Ordering::Release);
        tracing::info!(name = %self.config.name, "Shutdown complete");
    }

    pub fn state(&self) -> LifecycleState {
        if self.stopped.load(Ordering::Acquire) {
            LifecycleState::Stopped
        } else if self.ctx.is_cancelled() {
            LifecycleState::ShuttingDown
        } else {
            LifecycleState::Running
        }
    }

    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    pub fn identity(&self) -> &IdentitySource {
        &self.identity
    }

    /// Registry connection, `None` when standalone.
    pub fn registry(&self) -> Option<&Arc<RegistryConnection>> {
        self.registry.as_ref()
    }

    /// URL advertised to peers.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Listeners bound at startup.
    pub fn bound(&self) -> &[BoundEndpoint] {
        &self.bound
    }
}

/// Start the manager, serve until the context is cancelled, then shut down.
pub async fn run_manager(
    ctx: ProcessContext,
    config: Arc<ManagerConfig>,
    collaborators: Collaborators,
) -> Result<ShutdownCause, ManagerError> {
    let manager = Manager::start(ctx, config, collaborators).await?;
    let cause = manager.wait().await;
    tracing::info!(%cause, "Shutting down");
    manager.stop().await;
    Ok(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::identity::bundle::fixtures;
    use crate::net::StaticInterfaces;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> Arc<ManagerConfig> {
        Arc::new(ManagerConfig {
            listen_on: vec![
                Endpoint::tcp("0.0.0.0", 0),
                Endpoint::unix(dir.join("nsm.sock")),
            ],
            ..ManagerConfig::default()
        })
    }

    fn collaborators() -> Collaborators {
        let mut collaborators = Collaborators::with_identity(Arc::new(fixtures::provider()));
        collaborators.interfaces = Arc::new(StaticInterfaces(vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
        ]));
        collaborators
    }

    #[tokio::test]
    async fn start_resolves_public_url_and_binds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::start(ProcessContext::new(), config(dir.path()), collaborators())
            .await
            .unwrap();

        assert_eq!(manager.public_url(), "tcp://10.1.2.3:0");
        assert_eq!(manager.bound().len(), 2);
        assert!(manager.registry().is_none());
        assert_eq!(manager.state(), LifecycleState::Running);

        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(manager.identity().is_closed());
    }

    #[tokio::test]
    async fn concurrent_stops_shut_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            Manager::start(ProcessContext::new(), config(dir.path()), collaborators())
                .await
                .unwrap(),
        );

        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.stop().await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.stop().await }
        });
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(manager.context().cause(), Some(ShutdownCause::Stopped));
        assert!(!dir.path().join("nsm.sock").exists());
    }

    #[tokio::test]
    async fn stop_after_external_cancellation_keeps_first_cause() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProcessContext::new();
        let manager = Manager::start(ctx.clone(), config(dir.path()), collaborators())
            .await
            .unwrap();

        ctx.cancel(ShutdownCause::Signal("SIGTERM"));
        assert_eq!(manager.state(), LifecycleState::ShuttingDown);
        assert_eq!(manager.wait().await, ShutdownCause::Signal("SIGTERM"));

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(ctx.cause(), Some(ShutdownCause::Signal("SIGTERM")));
    }

    #[tokio::test]
    async fn crashed_listener_shuts_the_manager_down() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::start(ProcessContext::new(), config(dir.path()), collaborators())
            .await
            .unwrap();

        if let Some(set) = manager.listeners.lock().await.as_mut() {
            set.abort_loops();
        }

        let cause = tokio::time::timeout(Duration::from_secs(5), manager.wait())
            .await
            .unwrap();
        assert!(matches!(cause, ShutdownCause::ListenerFailed { .. }));
        assert_eq!(manager.state(), LifecycleState::ShuttingDown);

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(manager.context().cause(), Some(cause));
        assert!(manager.identity().is_closed());
        assert!(!dir.path().join("nsm.sock").exists());
    }

    #[test]
    fn collaborators_take_the_identity_from_the_svid() {
        assert!(Collaborators::from_config(&ManagerConfig::default()).is_ok());

        let mut config = ManagerConfig::default();
        config.identity.id = Some("https://example.org/nsmgr".into());
        assert!(matches!(
            Collaborators::from_config(&config).err(),
            Some(ManagerError::IdentityUnavailable(_))
        ));
    }
}

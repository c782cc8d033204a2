//! Identity provisioning mechanisms.
//!
//! # Responsibilities
//! - Fetch the current X.509 identity bundle
//! - Notify the identity source when the bundle may have changed
//!
//! # Design Decisions
//! - Providers never retry; the source decides when to fetch again
//! - Change notifications are hints, the source always re-fetches in full

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use url::Url;

use crate::config::validation::check_spiffe_id;
use crate::config::IdentityConfig;
use crate::identity::{IdentityBundle, ProvisionError};

/// Source of X.509 identity bundles.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Fetch the current bundle.
    async fn fetch(&self) -> Result<IdentityBundle, ProvisionError>;

    /// Subscribe to change hints. Providers without push notifications return `None`
    /// and rely on periodic refresh.
    fn subscribe(&self) -> Result<Option<mpsc::UnboundedReceiver<()>>, ProvisionError> {
        Ok(None)
    }
}

/// Reads PEM files written by a SPIFFE helper and watches them for rotation.
pub struct FileIdentityProvider {
    expected_id: Option<Url>,
    cert_path: PathBuf,
    key_path: PathBuf,
    bundle_path: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileIdentityProvider {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            expected_id: None,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bundle_path: bundle_path.into(),
            watcher: Mutex::new(None),
        }
    }

    /// Reject bundles whose leaf carries any SPIFFE ID other than `id`.
    pub fn with_expected_id(mut self, id: Url) -> Self {
        self.expected_id = Some(id);
        self
    }

    /// Build a provider from the identity section of the configuration.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, ProvisionError> {
        let provider = Self::new(&config.cert_path, &config.key_path, &config.bundle_path);
        match &config.id {
            Some(id) => {
                let id = check_spiffe_id(id).map_err(ProvisionError::Invalid)?;
                Ok(provider.with_expected_id(id))
            }
            None => Ok(provider),
        }
    }

    fn paths(&self) -> [&Path; 3] {
        [&self.cert_path, &self.key_path, &self.bundle_path]
    }
}

#[async_trait]
impl IdentityProvider for FileIdentityProvider {
    async fn fetch(&self) -> Result<IdentityBundle, ProvisionError> {
        let cert = read(&self.cert_path).await?;
        let key = read(&self.key_path).await?;
        let bundle = read(&self.bundle_path).await?;
        let bundle = IdentityBundle::from_pem(&cert, &key, &bundle)?;

        match &self.expected_id {
            Some(expected) if expected != bundle.id() => Err(ProvisionError::Invalid(format!(
                "SVID identity {} does not match configured {expected}",
                bundle.id()
            ))),
            _ => Ok(bundle),
        }
    }

    fn subscribe(&self) -> Result<Option<mpsc::UnboundedReceiver<()>>, ProvisionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watched: Arc<BTreeSet<PathBuf>> =
            Arc::new(self.paths().iter().map(|p| p.to_path_buf()).collect());

        let filter = Arc::clone(&watched);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = event.paths.iter().any(|p| filter.contains(p));
                    if relevant && (event.kind.is_modify() || event.kind.is_create()) {
                        tracing::debug!(paths = ?event.paths, "Identity files changed");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Identity file watch error"),
            },
            Config::default(),
        )
        .map_err(|e| ProvisionError::Watch(e.to_string()))?;

        let dirs: BTreeSet<&Path> = watched.iter().filter_map(|p| p.parent()).collect();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| ProvisionError::Watch(format!("{}: {e}", dir.display())))?;
        }
        tracing::info!(files = ?watched, "Watching identity files");

        // The watcher stops delivering events when dropped.
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(Some(rx))
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, ProvisionError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ProvisionError::Unavailable {
            reason: format!("failed to read {}", path.display()),
            source: Some(source),
        })
}

/// Serves a fixed set of PEM documents.
#[derive(Clone)]
pub struct StaticIdentityProvider {
    cert_chain_pem: Arc<[u8]>,
    private_key_pem: Arc<[u8]>,
    trust_bundle_pem: Arc<[u8]>,
}

impl StaticIdentityProvider {
    pub fn from_pem(
        cert_chain_pem: &[u8],
        private_key_pem: &[u8],
        trust_bundle_pem: &[u8],
    ) -> Self {
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
            trust_bundle_pem: trust_bundle_pem.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn fetch(&self) -> Result<IdentityBundle, ProvisionError> {
        IdentityBundle::from_pem(
            &self.cert_chain_pem,
            &self.private_key_pem,
            &self.trust_bundle_pem,
        )
    }
}

//! Renewable workload identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::config::IdentityConfig;
use crate::identity::tls::{crypto_provider, TlsMaterial};
use crate::identity::{IdentityBundle, IdentityProvider, ProvisionError};
use crate::lifecycle::ProcessContext;
use crate::observability::metrics;

struct Snapshot {
    bundle: Arc<IdentityBundle>,
    material: Arc<TlsMaterial>,
}

/// Owner of the current identity bundle.
///
/// Cheap to clone; every clone observes the same bundle. Consumers should call
/// [`bundle`](Self::bundle) when they need it instead of holding on to the result.
#[derive(Clone)]
pub struct IdentitySource {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    crypto: Arc<CryptoProvider>,
    current: ArcSwap<Snapshot>,
    renewal: CancellationToken,
    closed: AtomicBool,
}

impl IdentitySource {
    /// Fetch the first bundle and start background renewal.
    ///
    /// Fails with [`ProvisionError`] when no valid bundle arrives within
    /// `identity.bootstrap_timeout_secs` or the context is cancelled first.
    pub async fn bootstrap(
        ctx: &ProcessContext,
        provider: Arc<dyn IdentityProvider>,
        config: &IdentityConfig,
    ) -> Result<Self, ProvisionError> {
        tracing::info!("Obtaining X.509 certificate source");
        let timeout = config.bootstrap_timeout();

        let bundle = tokio::select! {
            _ = ctx.cancelled() => return Err(ProvisionError::Cancelled),
            fetched = tokio::time::timeout(timeout, provider.fetch()) => match fetched {
                Ok(bundle) => bundle?,
                Err(_) => {
                    return Err(ProvisionError::Unavailable {
                        reason: format!("no identity bundle within {timeout:?}"),
                        source: None,
                    })
                }
            },
        };

        let crypto = crypto_provider();
        let snapshot = Snapshot::build(bundle, &crypto)?;
        tracing::info!(svid = %snapshot.bundle.id(), "Obtained X.509 SVID");

        let source = Self {
            inner: Arc::new(Inner {
                provider,
                crypto,
                current: ArcSwap::from_pointee(snapshot),
                renewal: ctx.child_token(),
                closed: AtomicBool::new(false),
            }),
        };

        let changes = match source.inner.provider.subscribe() {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(error = %e, "Identity change notifications unavailable, relying on periodic refresh");
                None
            }
        };
        let task = source.clone();
        let interval = config.refresh_interval();
        tokio::spawn(
            async move { task.renew_loop(interval, changes).await }
                .instrument(tracing::info_span!("identity_renewal")),
        );

        Ok(source)
    }

    /// Current bundle.
    pub fn bundle(&self) -> Arc<IdentityBundle> {
        Arc::clone(&self.inner.current.load().bundle)
    }

    /// SPIFFE ID of the current bundle.
    pub fn id(&self) -> Url {
        self.inner.current.load().bundle.id().clone()
    }

    pub(crate) fn material(&self) -> Arc<TlsMaterial> {
        Arc::clone(&self.inner.current.load().material)
    }

    pub(crate) fn crypto(&self) -> Arc<CryptoProvider> {
        Arc::clone(&self.inner.crypto)
    }

    /// Fetch a fresh bundle now. On failure the previous bundle stays in place.
    pub async fn renew(&self) -> Result<(), ProvisionError> {
        let result = async {
            let bundle = self.inner.provider.fetch().await?;
            Snapshot::build(bundle, &self.inner.crypto)
        }
        .await;

        metrics::record_identity_renewal(result.is_ok());
        let snapshot = result?;
        tracing::debug!(svid = %snapshot.bundle.id(), "Identity bundle renewed");
        self.inner.current.store(Arc::new(snapshot));
        Ok(())
    }

    /// Stop background renewal. Returns `true` for the call that closed the source.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.renewal.cancel();
        tracing::info!("Identity source closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn renew_loop(self, interval: Duration, mut changes: Option<mpsc::UnboundedReceiver<()>>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the bundle is fresh.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.renewal.cancelled() => break,
                _ = ticker.tick() => {}
                hint = next_change(&mut changes) => {
                    if hint.is_none() {
                        tracing::debug!("Identity change stream closed");
                        changes = None;
                        continue;
                    }
                }
            }

            if let Err(e) = self.renew().await {
                tracing::warn!(error = %e, "Identity renewal failed, keeping previous bundle");
            }
        }
        tracing::debug!("Identity renewal stopped");
    }
}

async fn next_change(changes: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match changes {
        Some(rx) => {
            let hint = rx.recv().await;
            // Collapse bursts (a rotation touches several files).
            while rx.try_recv().is_ok() {}
            hint
        }
        None => std::future::pending().await,
    }
}

impl Snapshot {
    fn build(bundle: IdentityBundle, crypto: &Arc<CryptoProvider>) -> Result<Self, ProvisionError> {
        let material = TlsMaterial::build(&bundle, crypto)?;
        Ok(Self {
            bundle: Arc::new(bundle),
            material: Arc::new(material),
        })
    }
}

impl fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySource")
            .field("id", &self.inner.current.load().bundle.id().as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

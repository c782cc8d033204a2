//! Wiring of identity, policy and registry into the processing chain.
//!
//! The chain itself is built by a [`ChainBuilder`]; this module only gathers
//! its inputs and hands them over. Construction failures surface immediately.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::Router;
use rustls::ClientConfig;
use serde::Serialize;

use crate::chain::Authorizer;
use crate::identity::{
    mtls_client_config, IdentitySource, IdentityTokenGenerator, TlsError, TokenError,
    TokenGenerator,
};
use crate::lifecycle::ProcessContext;
use crate::registry::RegistryConnection;

/// Self-description this manager publishes to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerRecord {
    pub name: String,
    pub url: String,
}

/// Options applied to every outbound call the chain makes.
#[derive(Clone)]
pub struct ClientOptions {
    /// mTLS client credentials accepting any peer identity.
    pub tls: Arc<ClientConfig>,
    /// Block calls until the peer is reachable instead of failing fast.
    pub wait_for_ready: bool,
    tokens: Arc<dyn TokenGenerator>,
}

impl ClientOptions {
    pub fn new(tls: Arc<ClientConfig>, tokens: Arc<dyn TokenGenerator>) -> Self {
        Self {
            tls,
            wait_for_ready: true,
            tokens,
        }
    }

    /// `Authorization` header carrying a freshly issued token.
    pub fn authorization(&self) -> Result<HeaderValue, TokenError> {
        let token = self.tokens.generate()?;
        Ok(HeaderValue::from_str(&format!("Bearer {}", token.value))?)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("wait_for_ready", &self.wait_for_ready)
            .finish_non_exhaustive()
    }
}

/// Everything a chain builder receives.
pub struct ChainInputs {
    pub ctx: ProcessContext,
    pub record: ManagerRecord,
    pub authorizer: Arc<dyn Authorizer>,
    pub tokens: Arc<dyn TokenGenerator>,
    /// `None` when running standalone.
    pub registry: Option<Arc<RegistryConnection>>,
    pub client: ClientOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid chain input: {0}")]
    Invalid(String),
    #[error("failed to build client credentials: {0}")]
    Credentials(#[from] TlsError),
}

/// Builds the request-processing chain.
pub trait ChainBuilder: Send + Sync + 'static {
    fn build(&self, inputs: ChainInputs) -> Result<Box<dyn ProcessingChain>, ChainError>;
}

/// A built chain that can attach its handlers to a server.
pub trait ProcessingChain: Send + Sync {
    fn register(&self, server: Router) -> Router;
}

/// Gather the chain inputs from the identity source and hand them to `builder`.
pub fn assemble_chain(
    ctx: &ProcessContext,
    record: ManagerRecord,
    source: &IdentitySource,
    authorizer: Arc<dyn Authorizer>,
    registry: Option<Arc<RegistryConnection>>,
    max_token_lifetime: Duration,
    builder: &dyn ChainBuilder,
) -> Result<Box<dyn ProcessingChain>, ChainError> {
    let tokens: Arc<dyn TokenGenerator> = Arc::new(IdentityTokenGenerator::new(
        source.clone(),
        max_token_lifetime,
    ));
    let client = ClientOptions::new(mtls_client_config(source)?, Arc::clone(&tokens));

    tracing::info!(
        name = %record.name,
        url = %record.url,
        standalone = registry.is_none(),
        "Assembling processing chain"
    );

    builder.build(ChainInputs {
        ctx: ctx.clone(),
        record,
        authorizer,
        tokens,
        registry,
        client,
    })
}

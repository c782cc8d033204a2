//! Workload identity subsystem.
//!
//! # Data Flow
//! ```text
//! IdentityProvider (PEM files, static bundle)
//!     → source.rs (bootstrap, background renewal, close)
//!     → tls.rs (mTLS server/client configs resolving the live bundle)
//!     → token.rs (per-request bearer tokens signed with the SVID key)
//! ```
//!
//! # Design Decisions
//! - A bundle is always present once bootstrap succeeds; renewal failures keep the old one
//! - Consumers re-fetch from the source instead of caching bundle contents

pub mod bundle;
pub mod provider;
pub mod source;
pub mod tls;
pub mod token;

pub use bundle::IdentityBundle;
pub use provider::{FileIdentityProvider, IdentityProvider, StaticIdentityProvider};
pub use source::IdentitySource;
pub use tls::{mtls_client_config, mtls_server_config, TlsError};
pub use token::{IdentityTokenGenerator, Token, TokenError, TokenGenerator};

/// Errors raised while obtaining an identity bundle.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("identity provider unavailable: {reason}")]
    Unavailable {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("invalid identity bundle: {0}")]
    Invalid(String),
    #[error("identity bundle unusable for TLS: {0}")]
    Credentials(#[from] TlsError),
    #[error("failed to watch identity files: {0}")]
    Watch(String),
    #[error("cancelled while waiting for an identity bundle")]
    Cancelled,
}

//! Processing chain subsystem.
//!
//! # Data Flow
//! ```text
//! IdentitySource + Authorizer + Option<RegistryConnection> + ManagerRecord
//!     → assembler.rs (token generator, mTLS client options)
//!     → ChainBuilder (local.rs by default)
//!     → ProcessingChain::register(Router)
//! ```

pub mod assembler;
pub mod authorize;
pub mod local;

pub use assembler::{
    assemble_chain, ChainBuilder, ChainError, ChainInputs, ClientOptions, ManagerRecord,
    ProcessingChain,
};
pub use authorize::{
    authorization_middleware, AllowAll, AuthorizationError, AuthorizationRequest, Authorizer,
};
pub use local::LocalChainBuilder;

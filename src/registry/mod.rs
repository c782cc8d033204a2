//! Registry connectivity.
//!
//! # Data Flow
//! ```text
//! registry_url (config)
//!     → connector.rs (standalone when unset, bounded mTLS dial otherwise)
//!     → RegistryConnection handed to the chain builder
//! ```

pub mod connector;

pub use connector::{
    connect_registry, RegistryConnection, RegistryDialer, RegistryError, RegistryIo,
    TlsRegistryDialer,
};

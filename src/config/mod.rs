//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (NSM_* environment overrides)
//!     → validation.rs (semantic checks)
//!     → ManagerConfig (validated, immutable)
//!     → shared via Arc with the lifecycle controller
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; listen endpoints never change at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod endpoint;
pub mod loader;
pub mod schema;
pub mod validation;

pub use endpoint::{Endpoint, EndpointParseError};
pub use loader::{load_config, ConfigError};
pub use schema::{
    IdentityConfig, LogFormat, ManagerConfig, ObservabilityConfig, RegistryConfig,
    ShutdownConfig,
};

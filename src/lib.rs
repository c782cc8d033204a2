//! Network service mesh manager.
//!
//! Acquires a workload identity, optionally connects to the registry,
//! assembles the processing chain, and serves it on every configured
//! endpoint until the process context is cancelled.

pub mod chain;
pub mod config;
pub mod identity;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use config::ManagerConfig;
pub use lifecycle::{run_manager, Collaborators, Manager, ManagerError, ProcessContext};

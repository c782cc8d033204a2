//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (manager.rs):
//!     Identity bootstrap → Registry dial → Public URL → Chain → Listeners bound
//!
//! Shutdown (manager.rs):
//!     Context cancelled (signal, listener failure, Stop) → Drain listeners → Close identity
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Cancel the process context
//! ```
//!
//! # Design Decisions
//! - One process context (context.rs); the first cancellation wins and records its cause
//! - Fatal startup errors are returned; failures after startup cancel the context
//! - Shutdown has a drain deadline, after which remaining connections are aborted

pub mod context;
pub mod manager;
pub mod signals;

pub use context::{ProcessContext, ShutdownCause};
pub use manager::{run_manager, Collaborators, LifecycleState, Manager, ManagerError};
pub use signals::spawn_signal_handler;

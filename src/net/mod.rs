//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! listen_on endpoints (config)
//!     → public_addr.rs (URL advertised to peers)
//!     → listener.rs (one serve loop per endpoint, bound before startup returns)
//!         → TCP: axum-server, mTLS when credentials are present
//!         → unix: axum::serve on a filesystem socket
//!
//! Serve loop states:
//!     Binding → Serving → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Startup is a barrier over all endpoints; no endpoint is skipped
//! - The first failure after startup cancels the process context

pub mod listener;
pub mod public_addr;

pub use listener::{BoundEndpoint, ListenerError, ListenerSet};
pub use public_addr::{
    default_endpoint, resolve_public_url, InterfaceAddrs, StaticInterfaces, SystemInterfaces,
};

//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound dial (registry):
//!     → bounded by the connector's dial timeout
//!     → on transient failure: backoff.rs schedules the next attempt (wait-for-ready)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable for startup dials; the backoff never outlives them
//! - Jitter spreads reconnect storms when many managers restart together

pub mod backoff;

pub use backoff::Backoff;

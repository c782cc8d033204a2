//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGTERM and SIGINT handlers
//! - Translate the first signal into process context cancellation
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT while shutting down forces an immediate exit

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::lifecycle::{ProcessContext, ShutdownCause};

/// Exit status used when a second signal interrupts a graceful shutdown.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Install the handlers and spawn the task that watches them.
///
/// Handlers are registered before this returns, so a signal delivered right
/// after the call is not lost.
pub fn spawn_signal_handler(ctx: ProcessContext) -> io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let task = async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = ctx.cancelled() => return,
        };
        tracing::info!(signal = name, "Received signal, starting graceful shutdown");
        ctx.cancel(ShutdownCause::Signal(name));

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting immediately");
        std::process::exit(FORCED_EXIT_CODE);
    };

    Ok(tokio::spawn(task.instrument(tracing::info_span!("signals"))))
}

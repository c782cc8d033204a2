//! Network service mesh manager (nsmgr)
//!
//! # Architecture Overview
//!
//! ```text
//!   config ──▶ identity ──▶ registry ──▶ public URL ──▶ chain ──▶ listeners
//!   (TOML,     (SVID +      (optional    (first TCP     (local     (tcp: mTLS,
//!    NSM_*)     renewal)     mTLS dial)   endpoint)      router)    unix: plain)
//!
//!   SIGTERM / SIGINT / listener failure ──▶ process context cancelled
//!       ──▶ drain listeners ──▶ close identity ──▶ exit
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use nsmgr::config::load_config;
use nsmgr::lifecycle::spawn_signal_handler;
use nsmgr::observability::{logging, metrics};
use nsmgr::{run_manager, Collaborators, ProcessContext};

#[derive(Parser)]
#[command(name = "nsmgr")]
#[command(about = "Network service mesh manager", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. NSM_* variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nsmgr: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("nsmgr: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        name = %config.name,
        listen_on = ?config.listen_on.iter().map(ToString::to_string).collect::<Vec<_>>(),
        registry = ?config.registry_url.as_ref().map(ToString::to_string),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let ctx = ProcessContext::new();
    if let Err(e) = spawn_signal_handler(ctx.clone()) {
        tracing::error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    let collaborators = match Collaborators::from_config(&config) {
        Ok(collaborators) => collaborators,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up collaborators");
            return ExitCode::FAILURE;
        }
    };

    match run_manager(ctx, Arc::new(config), collaborators).await {
        Ok(cause) => {
            tracing::info!(%cause, "nsmgr stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "nsmgr failed to start");
            ExitCode::FAILURE
        }
    }
}

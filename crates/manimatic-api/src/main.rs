//! `manimatic-api` binary entrypoint.
//!
//! Loads configuration from flags and environment variables, resolves
//! provider secrets, and serves until SIGINT/SIGTERM.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use manimatic_api::config::Args;
use manimatic_core::init_logging;

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format, &args.log_level);

    let config = args.into_config().await?;
    tracing::debug!(config = ?config, "configuration loaded");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    manimatic_api::server::run(config, cancel).await?;
    tracing::info!("API shut down cleanly");
    Ok(())
}

//! Cost exporter - publishes cloud billing costs as gauges over HTTP.

mod config;
mod providers;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cost::{MetricRegistry, Scheduler};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %cli.listen_addr,
        query_period_secs = cli.query_period,
        startup_delay_secs = cli.startup_delay,
        "Starting cost exporter"
    );

    let registry = Arc::new(MetricRegistry::new());
    let mut scheduler = Scheduler::new(Arc::clone(&registry));

    for provider in providers::build_providers(&cli) {
        for descriptor in provider.metrics() {
            registry
                .register(descriptor)
                .with_context(|| format!("Failed to register metrics of {}", provider.name()))?;
        }
        scheduler
            .register(provider, cli.query_period(), cli.startup_delay())
            .context("Failed to register provider job")?;
    }
    scheduler.start().context("Failed to start scheduler")?;

    let served = server::run_server(Arc::clone(&registry), cli.listen_addr, shutdown_signal()).await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server stopped");
    }

    scheduler
        .shutdown()
        .await
        .context("Failed to stop scheduler")?;
    registry.close();
    info!("Cost exporter stopped");

    served
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

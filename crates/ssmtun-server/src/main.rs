use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ssmtun_common::RangePortAllocator;
use ssmtun_server::{ControlPlane, RequestDefaults, ServerConfig, SsmSessionLauncher, TunnelTracker};

/// SSM tunnel daemon - starts each named tunnel once and shares it
#[derive(Parser, Debug)]
#[command(name = "ssmtun-server")]
#[command(about = "Deduplicating AWS SSM port-forwarding daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ssmtun.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ssmtun_server=info".parse()?)
                .add_directive("ssmtun_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting ssmtun daemon with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Control plane port: {}", config.control_port);
    tracing::info!("Grace period: {:?}", config.grace_period);
    tracing::info!(
        "Local port range: {}-{}",
        config.port_range.0,
        config.port_range.1
    );
    tracing::info!(
        "AWS CLI: {} (credentials from {})",
        config.cli_path,
        config.credentials.source()
    );

    let launcher = Arc::new(SsmSessionLauncher::new(
        config.cli_path.clone(),
        config.credentials.clone(),
    ));
    let allocator = Arc::new(RangePortAllocator::new(
        config.port_range.0,
        config.port_range.1,
    ));
    let tracker = Arc::new(TunnelTracker::new(
        launcher,
        allocator,
        config.tracker_config(),
    ));

    let control_plane = ControlPlane::new(
        tracker,
        RequestDefaults {
            target: config.default_target.clone(),
            region: config.default_region.clone(),
        },
    );

    let control_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.control_port));

    tokio::select! {
        result = control_plane.run(control_addr) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping tunnels...");
        }
    }

    tracing::info!("Daemon shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

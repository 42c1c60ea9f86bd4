//! netvision-relay - relay hub and discovery beacon
//!
//! One process hosting the WebSocket broadcast bus devices and viewers
//! connect to, plus the UDP beacon that lets devices find it. Normally
//! spawned and supervised by netvision-daemon, but runs fine on its own:
//!
//!   netvision-relay --ws-port 8970 --discovery-port 8971

use anyhow::Result;
use clap::Parser;
use netvision_core::config::{DEFAULT_DISCOVERY_PORT, DEFAULT_WS_PORT};
use netvision_core::{DiscoveryBeacon, DiscoveryBeaconOptions, RelayHub, RelayHubOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netvision-relay")]
#[command(about = "NetVision relay hub and discovery beacon")]
#[command(version)]
struct Args {
    /// WebSocket port the relay hub listens on
    #[arg(long, default_value_t = DEFAULT_WS_PORT)]
    ws_port: u16,

    /// UDP port the discovery beacon binds and broadcasts on
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Disable the discovery beacon
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut hub = RelayHub::new(RelayHubOptions { port: args.ws_port });
    if let Err(e) = hub.start().await {
        error!(port = args.ws_port, error = %e, "Failed to start relay hub");
        return Err(e);
    }

    let mut beacon = if args.no_discovery {
        None
    } else {
        match DiscoveryBeacon::bind(DiscoveryBeaconOptions::new(
            args.discovery_port,
            args.ws_port,
        ))
        .await
        {
            Ok(mut beacon) => {
                beacon.start();
                Some(beacon)
            }
            Err(e) => {
                // The hub is still reachable by explicit address.
                warn!(port = args.discovery_port, error = %e, "Discovery beacon unavailable");
                None
            }
        }
    };

    shutdown_signal().await;
    info!("Shutting down relay");
    if let Some(beacon) = beacon.as_mut() {
        beacon.stop();
    }
    hub.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

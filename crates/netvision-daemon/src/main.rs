//! netvision-daemon - debugger supervisor and control plane
//!
//! Boots the relay and viewer child processes, serves the control-plane
//! HTTP endpoints, opens the viewer tab once things have settled, and tears
//! everything down on `POST /shutdown` or a termination signal.

mod control;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use netvision_core::launcher::{open_viewer, TabGuard};
use netvision_core::NetvisionConfig;
use tracing::{error, info};

use supervisor::{Supervisor, SupervisorOptions, SHUTDOWN_GRACE, VIEWER_SETTLE_DELAY};

#[derive(Parser, Debug)]
#[command(name = "netvision-daemon")]
#[command(about = "NetVision debugger supervisor")]
#[command(version)]
struct Args {
    /// Project root the viewer server runs in
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Force production mode regardless of config
    #[arg(long)]
    production: bool,

    /// Override the control-plane port
    #[arg(long)]
    control_port: Option<u16>,

    /// Do not open the viewer in a browser
    #[arg(long)]
    no_open: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = std::env::temp_dir().join("netvision").join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "netvision-daemon.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panic hook: normal panic output goes to stderr, which the trigger may
    // have suppressed; make sure panics land in the log file too.
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let args = Args::parse();
    let project_root = match args.project_root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };

    let mut config = NetvisionConfig::discover(&project_root).apply_env();
    if args.production {
        config.production = true;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    info!(
        production = config.production,
        ws_port = config.ws_port,
        control_port = config.control_port,
        project_root = %project_root.display(),
        "Starting NetVision supervisor"
    );

    let supervisor = Arc::new(Supervisor::new(SupervisorOptions {
        config: config.clone(),
        project_root,
        grace_delay: SHUTDOWN_GRACE,
        force_exit: true,
    }));
    supervisor.start()?;

    if !args.no_open {
        let viewer_url = config.viewer_url();
        tokio::spawn(async move {
            tokio::time::sleep(VIEWER_SETTLE_DELAY).await;
            open_viewer(&TabGuard::new(), &viewer_url);
        });
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.control_port))?;
    info!(port = config.control_port, "Control plane listening");

    let app = control::router(supervisor.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    info!("Supervisor exited");
    Ok(())
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

/// Resolve on Ctrl+C or SIGTERM, routing either into the supervisor's
/// teardown before the HTTP server winds down.
async fn shutdown_signal(supervisor: Arc<Supervisor>) {
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
    info!("Termination signal received");
    supervisor.shutdown();
}

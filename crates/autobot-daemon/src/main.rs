//! autobot daemon
//!
//! Owns the cluster inventory and leases and serves them over REST.

use anyhow::{anyhow, Context};
use autobot_api::create_router;
use autobot_core::{AutobotConfig, LogFormat, LoggingConfig};
use autobot_scheduler::Scheduler;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// autobot daemon - cluster GPU slot resolver
#[derive(Parser, Debug)]
#[command(name = "autobotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "AUTOBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Command-line flags win over the file and environment
    fn apply(&self, config: &mut AutobotConfig) {
        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match logging.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("Failed to set subscriber: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        AutobotConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        nodes = config.nodes.len(),
        "Starting autobot daemon"
    );
    if config.nodes.is_empty() {
        warn!("No nodes configured, every allocation will fail");
    }

    let scheduler =
        Arc::new(Scheduler::from_config(&config).context("Failed to create scheduler")?);

    if let Some(path) = scheduler.snapshot_path() {
        scheduler
            .restore_snapshot(path)
            .await
            .with_context(|| format!("Failed to restore snapshot {}", path.display()))?;
    }

    let summary = scheduler.refresh().await;
    info!(
        probed = summary.probed,
        alive = summary.succeeded,
        failed = summary.failed,
        "Initial node refresh complete"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = scheduler.spawn_background(shutdown_rx);

    let mut router = create_router(scheduler.clone());
    if config.api.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.api.address, config.api.port
            )
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    if let Some(path) = scheduler.snapshot_path() {
        scheduler
            .save_snapshot(path)
            .await
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        info!(path = %path.display(), "Final snapshot written");
    }

    Ok(())
}

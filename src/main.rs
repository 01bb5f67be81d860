//! Laiska node entry point
//!
//! Boot order: logging, boot recovery, configuration, then the HTTP API.
//! Recovery needs no configuration and runs even when config.json is unreadable.

use anyhow::{Context, Result};
use clap::Parser;
use laiska_lib::engine::{
    api::{create_router, ApiState},
    config::NodeConfig,
    device::{DeviceControl, LogSignal, ProcessDevice},
    updater::{decide, DeviceLayout, OtaContext},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "laiska_lib=info,laiska_node=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "laiska-node")]
#[command(version)]
#[command(about = "Laiska plant-monitor node", long_about = None)]
struct Args {
    /// Device root holding the firmware tree and update records
    #[arg(short, long, env = "LAISKA_ROOT", default_value = ".")]
    root: PathBuf,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();

    let device: Arc<dyn DeviceControl> = Arc::new(ProcessDevice::new());
    let outcome = decide(&DeviceLayout::new(&args.root), &LogSignal, device.as_ref());
    if outcome.interrupted {
        warn!("Booting with an interrupted update; see backup_version/ for the previous release");
    }

    let mut config = NodeConfig::load(&args.root)
        .with_context(|| format!("loading configuration from {}", args.root.display()))?;
    if let Some(port) = args.port {
        config.api.port = port;
    }

    let ota = OtaContext::from_config(&args.root, &config.ota, Arc::clone(&device))
        .context("setting up firmware fetcher")?;
    let state = ApiState::new(ota, device, config.api.reset_delay());
    let app = create_router(state);

    let addr = config.api.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Laiska node {} listening on http://{}", env!("CARGO_PKG_VERSION"), addr);
    axum::serve(listener, app).await?;
    Ok(())
}

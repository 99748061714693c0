//! Fleet agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};

use fleet_agent::hub_client::{self, AgentRuntime};
use fleet_agent::session::SerialOpener;
use fleet_agent::AgentConfig;

/// Edge agent driving serial-attached GSM modems for the fleet gateway.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "agent.json")]
    config: PathBuf,

    /// Override the server URL from config/env.
    #[arg(long)]
    server_url: Option<String>,

    /// Override the device id from config/env.
    #[arg(long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }
    if let Some(device_id) = cli.device_id {
        config.device_id = device_id;
    }
    log::info!(
        "fleet-agent starting as {} against {}",
        config.device_id,
        config.server_url
    );

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let runtime = Arc::new(
        AgentRuntime::new(&config, Arc::new(SerialOpener), outgoing_tx).await,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("ctrl-c handler failed: {e}");
            return;
        }
        log::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    hub_client::run(
        Arc::clone(&runtime),
        outgoing_rx,
        config.server_url.clone(),
        shutdown_rx,
    )
    .await;

    runtime.shutdown().await;
    log::info!("fleet-agent stopped");
    Ok(())
}

//! Fleet server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use fleet_server::auth::AuthKeys;
use fleet_server::http::{router, AppState};
use fleet_server::hub::Hub;
use fleet_server::store::Db;
use fleet_server::ServerConfig;

/// Central server for the GSM modem fleet gateway.
#[derive(Parser, Debug)]
#[command(name = "fleet-server", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "server.json")]
    config: PathBuf,

    /// Override the listen address from config/env.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let db = Db::connect(&config.database_url).await?;
    let hub = Arc::new(Hub::new(db.clone()));
    let auth = AuthKeys::new(&config.jwt.key, config.issuer(), config.audience());

    let state = AppState { db, hub, auth };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.listen))?;
    log::info!("fleet-server listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("ctrl-c handler failed: {e}");
            }
            log::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    log::info!("fleet-server stopped");
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use anser::api::{ApiServer, ApiServerConfig};
use anser::database::Db;
use anser::events::EventBus;
use anser::logs::LogBuffer;
use anser::secrets::SecretStore;
use anser::server::manager::TunnelManager;
use anser::server::netwatch;

#[derive(Parser, Debug)]
#[command(name = "anser", about = "SSH tunnel fleet daemon with per-tunnel SOCKS5 proxies")]
struct Args {
    /// Directory for the database, secrets and key material.
    #[arg(long, default_value = "./anser-data")]
    data_dir: PathBuf,

    /// Control API port.
    #[arg(long, default_value_t = 7070)]
    api_port: u16,

    /// Fallback port when the primary is busy.
    #[arg(long, default_value_t = 7071)]
    api_fallback_port: u16,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("starting anser (data dir {})", args.data_dir.display());

    let db = Db::open(&args.data_dir).await?;
    let secrets = SecretStore::open(&args.data_dir)?;
    let events = EventBus::new();
    let logs = Arc::new(LogBuffer::new());

    let manager = TunnelManager::new(db, secrets, events, logs);
    manager.init().await?;

    let shutdown = CancellationToken::new();

    // The platform connectivity notifier feeds this channel; the sender end
    // stays alive for the daemon's lifetime.
    let (_net_tx, net_rx) = mpsc::channel(8);
    netwatch::spawn(manager.clone(), net_rx, shutdown.clone());

    manager.connect_startup_servers().await;

    let api = ApiServer::new(
        ApiServerConfig {
            port: args.api_port,
            fallback_port: args.api_fallback_port,
        },
        manager.clone(),
    );
    let api_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = api.start(api_shutdown).await {
            error!("control api unavailable: {e:#}; tunnel engine continues headless");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    manager.shutdown().await;
    shutdown.cancel();
    Ok(())
}
